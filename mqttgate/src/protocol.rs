//! MQTT protocol utilities.
//!
//! Packet encoding and decoding is done by `rumqttc::mqttbytes` for both
//! MQTT 3.1.1 (v4) and MQTT 5.0 (v5). This module adds async read/write
//! helpers per version and a version-neutral vocabulary ([`Frame`] inbound,
//! [`Reply`] outbound) so the session state machine is written once.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::types::{Message, ProtocolVersion, QoS};

/// Maximum packet size (1MB default).
pub const MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Read size for socket reads.
const READ_CHUNK: usize = 4096;

/// CONNECT fields the gate cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectFrame {
    pub client_id: String,
    pub username: Option<String>,
    pub password: Vec<u8>,
    pub keep_alive: u16,
    pub clean_session: bool,
}

/// Inbound packet, independent of protocol version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Connect(ConnectFrame),
    Publish {
        topic: String,
        qos: QoS,
        pkid: u16,
        retain: bool,
        payload: Bytes,
    },
    PubRel {
        pkid: u16,
    },
    Subscribe {
        pkid: u16,
        filters: Vec<String>,
    },
    Unsubscribe {
        pkid: u16,
        filters: Vec<String>,
    },
    PingReq,
    Disconnect,
    /// Anything a broker does not expect from a client.
    Other(&'static str),
}

impl Frame {
    pub fn name(&self) -> &'static str {
        match self {
            Frame::Connect(_) => "Connect",
            Frame::Publish { .. } => "Publish",
            Frame::PubRel { .. } => "PubRel",
            Frame::Subscribe { .. } => "Subscribe",
            Frame::Unsubscribe { .. } => "Unsubscribe",
            Frame::PingReq => "PingReq",
            Frame::Disconnect => "Disconnect",
            Frame::Other(name) => name,
        }
    }
}

/// CONNACK outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnAckCode {
    Accepted,
    BadUserNamePassword,
    NotAuthorized,
}

/// Outbound packet, independent of protocol version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    ConnAck(ConnAckCode),
    /// One entry per requested filter; `false` is a failure code.
    SubAck { pkid: u16, granted: Vec<bool> },
    UnsubAck { pkid: u16, count: usize },
    /// MQTT 3.1.1 acks carry no reason code, so `authorized` only shows on v5.
    PubAck { pkid: u16, authorized: bool },
    PubRec { pkid: u16, authorized: bool },
    PubComp { pkid: u16 },
    PingResp,
    Publish(Message),
}

/// Inspect the start of a CONNECT packet for the protocol level.
///
/// Returns `Ok(None)` until enough bytes have arrived.
///
/// CONNECT packet structure:
/// - Fixed header: 1 byte (0x10 for CONNECT)
/// - Remaining length: 1-4 bytes
/// - Protocol Name Length: 2 bytes
/// - Protocol Name: "MQTT" (4 bytes)
/// - Protocol Level: 1 byte (4 for v3.1.1, 5 for v5.0)
pub fn detect_protocol_version(buf: &[u8]) -> Result<Option<ProtocolVersion>> {
    let Some(&first) = buf.first() else {
        return Ok(None);
    };
    if first != 0x10 {
        return Err(Error::ProtocolViolation(format!(
            "expected CONNECT packet, got header 0x{first:02x}"
        )));
    }

    let mut header_len = 1usize;
    let mut terminated = false;
    for &byte in buf.iter().skip(1).take(4) {
        header_len += 1;
        if byte & 0x80 == 0 {
            terminated = true;
            break;
        }
    }
    if !terminated {
        if header_len == 5 {
            return Err(Error::Protocol("malformed remaining length".to_string()));
        }
        return Ok(None);
    }

    // Protocol level offset: header_len + 2 (name length) + 4 (name "MQTT")
    let level_offset = header_len + 2 + 4;
    match buf.get(level_offset) {
        None => Ok(None),
        Some(4) => Ok(Some(ProtocolVersion::V4)),
        Some(5) => Ok(Some(ProtocolVersion::V5)),
        Some(level) => Err(Error::Protocol(format!("unsupported protocol level: {level}"))),
    }
}

/// Read until the protocol level of the first CONNECT is known.
pub async fn read_protocol_version<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut BytesMut,
) -> Result<ProtocolVersion> {
    loop {
        if let Some(version) = detect_protocol_version(buf)? {
            return Ok(version);
        }
        let mut tmp = [0u8; READ_CHUNK];
        let n = reader.read(&mut tmp).await?;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }
        buf.extend_from_slice(&tmp[..n]);
    }
}

/// Version-dispatching frame reader/writer for one connection.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    pub version: ProtocolVersion,
    pub max_packet_size: usize,
}

impl FrameCodec {
    pub fn new(version: ProtocolVersion, max_packet_size: usize) -> Self {
        Self {
            version,
            max_packet_size,
        }
    }

    pub async fn read_frame<R: AsyncRead + Unpin>(
        &self,
        reader: &mut R,
        buf: &mut BytesMut,
    ) -> Result<Frame> {
        match self.version {
            ProtocolVersion::V4 => {
                let packet = v4::read_packet(reader, buf, self.max_packet_size).await?;
                Ok(v4::to_frame(packet))
            }
            ProtocolVersion::V5 => {
                let packet = v5::read_packet(reader, buf, self.max_packet_size).await?;
                v5::to_frame(packet)
            }
        }
    }

    pub async fn write_reply<W: AsyncWrite + Unpin>(&self, writer: &mut W, reply: Reply) -> Result<()> {
        match self.version {
            ProtocolVersion::V4 => v4::write_packet(writer, v4::from_reply(reply)).await,
            ProtocolVersion::V5 => v5::write_packet(writer, v5::from_reply(reply)).await,
        }
    }
}

// ============================================================================
// V4 (MQTT 3.1.1)
// ============================================================================

pub mod v4 {
    use super::*;
    pub use rumqttc::mqttbytes::QoS;
    pub use rumqttc::mqttbytes::v4::*;

    /// Read a single MQTT v4 packet from an async reader.
    pub async fn read_packet<R: AsyncRead + Unpin>(
        reader: &mut R,
        buf: &mut BytesMut,
        max_size: usize,
    ) -> Result<Packet> {
        loop {
            if !buf.is_empty() {
                match Packet::read(buf, max_size) {
                    Ok(packet) => return Ok(packet),
                    Err(rumqttc::mqttbytes::Error::InsufficientBytes(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            }

            let mut tmp = [0u8; READ_CHUNK];
            let n = reader.read(&mut tmp).await?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
            buf.extend_from_slice(&tmp[..n]);
        }
    }

    /// Write a single MQTT v4 packet to an async writer.
    pub async fn write_packet<W: AsyncWrite + Unpin>(writer: &mut W, packet: Packet) -> Result<()> {
        let mut buf = BytesMut::with_capacity(packet.size());
        packet.write(&mut buf, super::MAX_PACKET_SIZE)?;
        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(())
    }

    pub(super) fn to_frame(packet: Packet) -> Frame {
        match packet {
            Packet::Connect(connect) => {
                let (username, password) = match connect.login {
                    Some(login) => (Some(login.username), login.password.into_bytes()),
                    None => (None, Vec::new()),
                };
                Frame::Connect(ConnectFrame {
                    client_id: connect.client_id,
                    username,
                    password,
                    keep_alive: connect.keep_alive,
                    clean_session: connect.clean_session,
                })
            }
            Packet::Publish(publish) => Frame::Publish {
                topic: publish.topic,
                qos: publish.qos.into(),
                pkid: publish.pkid,
                retain: publish.retain,
                payload: publish.payload,
            },
            Packet::PubRel(pubrel) => Frame::PubRel { pkid: pubrel.pkid },
            Packet::Subscribe(subscribe) => Frame::Subscribe {
                pkid: subscribe.pkid,
                filters: subscribe.filters.into_iter().map(|f| f.path).collect(),
            },
            Packet::Unsubscribe(unsubscribe) => Frame::Unsubscribe {
                pkid: unsubscribe.pkid,
                filters: unsubscribe.topics,
            },
            Packet::PingReq => Frame::PingReq,
            Packet::Disconnect => Frame::Disconnect,
            Packet::ConnAck(_) => Frame::Other("ConnAck"),
            Packet::PubAck(_) => Frame::Other("PubAck"),
            Packet::PubRec(_) => Frame::Other("PubRec"),
            Packet::PubComp(_) => Frame::Other("PubComp"),
            Packet::SubAck(_) => Frame::Other("SubAck"),
            Packet::UnsubAck(_) => Frame::Other("UnsubAck"),
            Packet::PingResp => Frame::Other("PingResp"),
        }
    }

    pub(super) fn from_reply(reply: Reply) -> Packet {
        match reply {
            Reply::ConnAck(code) => {
                let code = match code {
                    ConnAckCode::Accepted => ConnectReturnCode::Success,
                    ConnAckCode::BadUserNamePassword => ConnectReturnCode::BadUserNamePassword,
                    ConnAckCode::NotAuthorized => ConnectReturnCode::NotAuthorized,
                };
                create_connack(false, code)
            }
            Reply::SubAck { pkid, granted } => create_suback(
                pkid,
                granted
                    .into_iter()
                    .map(|ok| {
                        if ok {
                            SubscribeReasonCode::Success(QoS::AtMostOnce)
                        } else {
                            SubscribeReasonCode::Failure
                        }
                    })
                    .collect(),
            ),
            Reply::UnsubAck { pkid, .. } => create_unsuback(pkid),
            Reply::PubAck { pkid, .. } => Packet::PubAck(PubAck::new(pkid)),
            Reply::PubRec { pkid, .. } => Packet::PubRec(PubRec::new(pkid)),
            Reply::PubComp { pkid } => Packet::PubComp(PubComp::new(pkid)),
            Reply::PingResp => Packet::PingResp,
            Reply::Publish(msg) => create_publish(&msg.topic, &msg.payload, msg.retain),
        }
    }

    /// Create a CONNECT packet.
    pub fn create_connect(
        client_id: &str,
        username: Option<&str>,
        password: Option<&str>,
        keep_alive: u16,
        clean_session: bool,
    ) -> Packet {
        let mut connect = Connect::new(client_id);
        connect.keep_alive = keep_alive;
        connect.clean_session = clean_session;
        if let (Some(user), Some(pass)) = (username, password) {
            connect.set_login(user, pass);
        }
        Packet::Connect(connect)
    }

    /// Create a CONNACK packet.
    pub fn create_connack(session_present: bool, code: ConnectReturnCode) -> Packet {
        Packet::ConnAck(ConnAck::new(code, session_present))
    }

    /// Create a PUBLISH packet (QoS 0).
    pub fn create_publish(topic: &str, payload: &[u8], retain: bool) -> Packet {
        let mut publish = Publish::new(topic, QoS::AtMostOnce, payload.to_vec());
        publish.retain = retain;
        Packet::Publish(publish)
    }

    /// Create a PUBLISH packet at QoS 1 or 2.
    pub fn create_publish_qos(topic: &str, payload: &[u8], qos: QoS, pkid: u16) -> Packet {
        let mut publish = Publish::new(topic, qos, payload.to_vec());
        publish.pkid = pkid;
        Packet::Publish(publish)
    }

    /// Create a PUBREL packet.
    pub fn create_pubrel(pkid: u16) -> Packet {
        Packet::PubRel(PubRel::new(pkid))
    }

    /// Create a SUBSCRIBE packet.
    pub fn create_subscribe(pkid: u16, topics: &[&str]) -> Packet {
        let filters: Vec<SubscribeFilter> = topics
            .iter()
            .map(|t| SubscribeFilter::new(t.to_string(), QoS::AtMostOnce))
            .collect();

        let mut subscribe = Subscribe::new_many(filters);
        subscribe.pkid = pkid;
        Packet::Subscribe(subscribe)
    }

    /// Create a SUBACK packet.
    pub fn create_suback(pkid: u16, return_codes: Vec<SubscribeReasonCode>) -> Packet {
        Packet::SubAck(SubAck::new(pkid, return_codes))
    }

    /// Create an UNSUBSCRIBE packet.
    pub fn create_unsubscribe(pkid: u16, topics: &[&str]) -> Packet {
        let topics: Vec<String> = topics.iter().map(|t| t.to_string()).collect();
        Packet::Unsubscribe(Unsubscribe { pkid, topics })
    }

    /// Create an UNSUBACK packet.
    pub fn create_unsuback(pkid: u16) -> Packet {
        Packet::UnsubAck(UnsubAck::new(pkid))
    }

    /// Create a DISCONNECT packet.
    pub fn create_disconnect() -> Packet {
        Packet::Disconnect
    }
}

// ============================================================================
// V5 (MQTT 5.0)
// ============================================================================

pub mod v5 {
    use super::*;
    pub use rumqttc::v5::mqttbytes::QoS;
    pub use rumqttc::v5::mqttbytes::v5::{
        ConnAck, Connect, ConnectReturnCode, Disconnect, DisconnectReasonCode, Filter, Login,
        Packet, PingReq, PingResp, PubAck, PubAckReason, PubComp, PubCompReason, PubRec,
        PubRecReason, PubRel, PubRelReason, Publish, RetainForwardRule, SubAck, Subscribe,
        UnsubAck, UnsubAckReason, Unsubscribe,
    };

    pub type SubscribeReasonCode = rumqttc::v5::mqttbytes::v5::SubscribeReasonCode;

    /// Read a single MQTT v5 packet from an async reader.
    pub async fn read_packet<R: AsyncRead + Unpin>(
        reader: &mut R,
        buf: &mut BytesMut,
        max_size: usize,
    ) -> Result<Packet> {
        let max_size_opt = Some(max_size as u32);
        loop {
            if !buf.is_empty() {
                match Packet::read(buf, max_size_opt) {
                    Ok(packet) => return Ok(packet),
                    Err(rumqttc::v5::mqttbytes::Error::InsufficientBytes(_)) => {}
                    Err(e) => return Err(Error::Protocol(e.to_string())),
                }
            }

            let mut tmp = [0u8; READ_CHUNK];
            let n = reader.read(&mut tmp).await?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
            buf.extend_from_slice(&tmp[..n]);
        }
    }

    /// Write a single MQTT v5 packet to an async writer.
    pub async fn write_packet<W: AsyncWrite + Unpin>(writer: &mut W, packet: Packet) -> Result<()> {
        let max_size_opt = Some(super::MAX_PACKET_SIZE as u32);
        let mut buf = BytesMut::with_capacity(packet.size());
        packet
            .write(&mut buf, max_size_opt)
            .map_err(|e| Error::Protocol(e.to_string()))?;
        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(())
    }

    pub(super) fn to_frame(packet: Packet) -> Result<Frame> {
        let frame = match packet {
            Packet::Connect(connect, _, login) => {
                let (username, password) = match login {
                    Some(login) => (Some(login.username), login.password.into_bytes()),
                    None => (None, Vec::new()),
                };
                Frame::Connect(ConnectFrame {
                    client_id: connect.client_id,
                    username,
                    password,
                    keep_alive: connect.keep_alive,
                    clean_session: connect.clean_start,
                })
            }
            Packet::Publish(publish) => {
                let topic = String::from_utf8(publish.topic.to_vec()).map_err(|_| {
                    Error::ProtocolViolation("PUBLISH topic is not valid UTF-8".to_string())
                })?;
                Frame::Publish {
                    topic,
                    qos: publish.qos.into(),
                    pkid: publish.pkid,
                    retain: publish.retain,
                    payload: publish.payload,
                }
            }
            Packet::PubRel(pubrel) => Frame::PubRel { pkid: pubrel.pkid },
            Packet::Subscribe(subscribe) => Frame::Subscribe {
                pkid: subscribe.pkid,
                filters: subscribe.filters.into_iter().map(|f| f.path).collect(),
            },
            Packet::Unsubscribe(unsubscribe) => Frame::Unsubscribe {
                pkid: unsubscribe.pkid,
                filters: unsubscribe.filters,
            },
            Packet::PingReq(_) => Frame::PingReq,
            Packet::Disconnect(_) => Frame::Disconnect,
            _ => Frame::Other("unexpected v5 packet"),
        };
        Ok(frame)
    }

    pub(super) fn from_reply(reply: Reply) -> Packet {
        match reply {
            Reply::ConnAck(code) => {
                let code = match code {
                    ConnAckCode::Accepted => ConnectReturnCode::Success,
                    ConnAckCode::BadUserNamePassword => ConnectReturnCode::BadUserNamePassword,
                    ConnAckCode::NotAuthorized => ConnectReturnCode::NotAuthorized,
                };
                create_connack(false, code)
            }
            Reply::SubAck { pkid, granted } => create_suback(
                pkid,
                granted
                    .into_iter()
                    .map(|ok| {
                        if ok {
                            SubscribeReasonCode::Success(QoS::AtMostOnce)
                        } else {
                            SubscribeReasonCode::NotAuthorized
                        }
                    })
                    .collect(),
            ),
            Reply::UnsubAck { pkid, count } => create_unsuback(pkid, count),
            Reply::PubAck { pkid, authorized } => Packet::PubAck(PubAck {
                pkid,
                reason: if authorized {
                    PubAckReason::Success
                } else {
                    PubAckReason::NotAuthorized
                },
                properties: None,
            }),
            Reply::PubRec { pkid, authorized } => Packet::PubRec(PubRec {
                pkid,
                reason: if authorized {
                    PubRecReason::Success
                } else {
                    PubRecReason::NotAuthorized
                },
                properties: None,
            }),
            Reply::PubComp { pkid } => Packet::PubComp(PubComp {
                pkid,
                reason: PubCompReason::Success,
                properties: None,
            }),
            Reply::PingResp => Packet::PingResp(PingResp),
            Reply::Publish(msg) => create_publish(&msg.topic, &msg.payload, msg.retain),
        }
    }

    /// Create a CONNECT packet.
    pub fn create_connect(
        client_id: &str,
        username: Option<&str>,
        password: Option<&str>,
        keep_alive: u16,
        clean_start: bool,
    ) -> Packet {
        let connect = Connect {
            keep_alive,
            client_id: client_id.to_string(),
            clean_start,
            properties: None,
        };

        let login = match (username, password) {
            (Some(user), Some(pass)) => Some(Login {
                username: user.to_string(),
                password: pass.to_string(),
            }),
            _ => None,
        };

        Packet::Connect(connect, None, login)
    }

    /// Create a CONNACK packet.
    pub fn create_connack(session_present: bool, code: ConnectReturnCode) -> Packet {
        Packet::ConnAck(ConnAck {
            session_present,
            code,
            properties: None,
        })
    }

    /// Create a PUBLISH packet (QoS 0).
    pub fn create_publish(topic: &str, payload: &[u8], retain: bool) -> Packet {
        Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain,
            topic: Bytes::copy_from_slice(topic.as_bytes()),
            pkid: 0,
            payload: Bytes::copy_from_slice(payload),
            properties: None,
        })
    }

    /// Create a PUBLISH packet at QoS 1 or 2.
    pub fn create_publish_qos(topic: &str, payload: &[u8], qos: QoS, pkid: u16) -> Packet {
        Packet::Publish(Publish {
            dup: false,
            qos,
            retain: false,
            topic: Bytes::copy_from_slice(topic.as_bytes()),
            pkid,
            payload: Bytes::copy_from_slice(payload),
            properties: None,
        })
    }

    /// Create a PUBREL packet.
    pub fn create_pubrel(pkid: u16) -> Packet {
        Packet::PubRel(PubRel {
            pkid,
            reason: PubRelReason::Success,
            properties: None,
        })
    }

    /// Create a SUBSCRIBE packet.
    pub fn create_subscribe(pkid: u16, topics: &[&str]) -> Packet {
        let filters: Vec<Filter> = topics
            .iter()
            .map(|t| Filter {
                path: t.to_string(),
                qos: QoS::AtMostOnce,
                nolocal: false,
                preserve_retain: false,
                retain_forward_rule: RetainForwardRule::OnEverySubscribe,
            })
            .collect();

        Packet::Subscribe(Subscribe {
            pkid,
            filters,
            properties: None,
        })
    }

    /// Create a SUBACK packet.
    pub fn create_suback(pkid: u16, return_codes: Vec<SubscribeReasonCode>) -> Packet {
        Packet::SubAck(SubAck {
            pkid,
            return_codes,
            properties: None,
        })
    }

    /// Create an UNSUBACK packet with one success reason per filter.
    pub fn create_unsuback(pkid: u16, count: usize) -> Packet {
        Packet::UnsubAck(UnsubAck {
            pkid,
            reasons: (0..count.max(1)).map(|_| UnsubAckReason::Success).collect(),
            properties: None,
        })
    }

    /// Create a DISCONNECT packet.
    pub fn create_disconnect() -> Packet {
        Packet::Disconnect(Disconnect {
            reason_code: DisconnectReasonCode::NormalDisconnection,
            properties: None,
        })
    }
}
