use core::convert::TryFrom;
use core::str;

use nom::{
    bytes::complete::{tag, take, take_while_m_n},
    combinator::{all_consuming, cond, map, map_opt, map_res, recognize, rest, verify},
    error::{context, ParseError, VerboseError},
    multi::{length_data, many1},
    number::complete::{be_u16, be_u8},
    sequence::{pair, tuple},
    IResult,
};

use crate::packet::*;

impl FixedHeader {
    /// Parses the fixed header that starts every MQTT Control Packet.
    pub fn parse<'a, E: ParseError<&'a [u8]>>(input: &'a [u8]) -> IResult<&'a [u8], Self, E> {
        map(
            tuple((
                map_res(
                    be_u8,
                    |b| -> Result<_, num_enum::TryFromPrimitiveError<Type>> {
                        let packet_type = Type::try_from((b >> 4) & 0x0F)?;
                        let packet_flags = b & 0x0F;

                        Ok((packet_type, packet_flags))
                    },
                ),
                varint,
            )),
            |((packet_type, packet_flags), remaining_length)| FixedHeader {
                packet_type,
                packet_flags,
                remaining_length,
            },
        )(input)
    }
}

const CONTINUATION_BIT: u8 = 0x80;

fn varint<'a, E: ParseError<&'a [u8]>>(input: &'a [u8]) -> IResult<&'a [u8], usize, E> {
    context(
        "variable length",
        map(
            verify(
                recognize(pair(
                    take_while_m_n(0, 3, |b| (b & CONTINUATION_BIT) != 0),
                    verify(be_u8, |b| (b & CONTINUATION_BIT) == 0),
                )),
                |s: &[u8]| s.len() <= 4,
            ),
            |s: &[u8]| {
                s.iter().enumerate().fold(0, |value, (i, b)| {
                    value + (usize::from(*b & !CONTINUATION_BIT) << (7 * i))
                })
            },
        ),
    )(input)
}

/// Binary Data is represented by a Two Byte Integer length which indicates the number of data bytes,
/// followed by that number of bytes. Thus, the length of Binary Data is limited to the range of 0 to 65,535 Bytes.
fn binary_data<'a, E: ParseError<&'a [u8]>>(input: &'a [u8]) -> IResult<&'a [u8], &'a [u8], E> {
    context("binary data", length_data(be_u16))(input)
}

/// Text fields in the Control Packets described later are encoded as UTF-8 strings.
fn utf8_str<'a, E: ParseError<&'a [u8]>>(input: &'a [u8]) -> IResult<&'a [u8], &'a str, E> {
    context("utf8 string", map_res(length_data(be_u16), str::from_utf8))(input)
}

const CLIENT_ID_MIN_LEN: usize = 1;
const CLIENT_ID_MAX_LEN: usize = 23;
const CLIENT_ID_CHARS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// The Client Identifier (ClientId) identifies the Client to the Server.
///
/// Each Client connecting to the Server has a unique ClientId.
/// The ClientId MUST be used by Clients and by Servers to identify state
/// that they hold relating to this MQTT Session between the Client and the Server [MQTT-3.1.3-2].
///
// The Server MUST allow ClientIds which are between 1 and 23 UTF-8 encoded bytes in length,
// and that contain only the characters [MQTT-3.1.3-5].
fn client_id<'a, E: ParseError<&'a [u8]>>(input: &'a [u8]) -> IResult<&'a [u8], &'a str, E> {
    context(
        "client id",
        verify(utf8_str, |s: &str| -> bool {
            (s.is_empty() || (CLIENT_ID_MIN_LEN <= s.len() && s.len() <= CLIENT_ID_MAX_LEN))
                && s.bytes().all(|b| CLIENT_ID_CHARS.contains(&b))
        }),
    )(input)
}

/// The Topic Name identifies the information channel to which payload data is published.
///
/// The label attached to an Application Message which is matched against the Subscriptions known to the Server.
/// The Server sends a copy of the Application Message to each Client that has a matching Subscription.
fn topic_name<'a, E: ParseError<&'a [u8]>>(input: &'a [u8]) -> IResult<&'a [u8], &'a str, E> {
    context(
        "topic name",
        verify(utf8_str, |s: &str| s.bytes().all(|c| c != b'#')),
    )(input)
}

/// An expression contained in a Subscription, to indicate an interest in one or more topics.
///
/// A Topic Filter can include wildcard characters.
fn topic_filter<'a, E: ParseError<&'a [u8]>>(input: &'a [u8]) -> IResult<&'a [u8], &'a str, E> {
    context("topic filter", utf8_str)(input)
}

/// A Subscription comprises a Topic Filter and a maximum QoS.
fn subscription<'a, E: ParseError<&'a [u8]>>(
    input: &'a [u8],
) -> IResult<&'a [u8], (&'a str, QoS), E> {
    context(
        "subscription",
        tuple((topic_filter, context("QoS", map_res(be_u8, QoS::try_from)))),
    )(input)
}

fn packet_id<'a, E: ParseError<&'a [u8]>>(input: &'a [u8]) -> IResult<&'a [u8], PacketId, E> {
    context("packet id", be_u16)(input)
}

/// Parses the bytes slice into a Packet.
pub fn parse(input: &[u8]) -> IResult<&[u8], Packet, VerboseError<&[u8]>> {
    let (input, fixed_header) = FixedHeader::parse(input)?;
    let (input, remaining) = take(fixed_header.remaining_length)(input)?;

    match fixed_header.packet_type {
        Type::CONNECT => {
            context("Connect", all_consuming(map(connect, Packet::Connect)))(remaining)
        }
        Type::CONNACK => context(
            "ConnectAck",
            all_consuming(map(connect_ack, Packet::ConnectAck)),
        )(remaining),
        Type::PUBLISH => context(
            "Publish",
            all_consuming(map(
                |input| {
                    publish(
                        input,
                        PublishFlags::from_bits_truncate(fixed_header.packet_flags),
                    )
                },
                Packet::Publish,
            )),
        )(remaining),
        Type::PUBACK => context(
            "PublishAck",
            all_consuming(map(packet_id, |packet_id| {
                Packet::PublishAck(PublishAck { packet_id })
            })),
        )(remaining),
        Type::PUBREC => context(
            "PublishReceived",
            all_consuming(map(packet_id, |packet_id| {
                Packet::PublishReceived(PublishReceived { packet_id })
            })),
        )(remaining),
        Type::PUBREL => context(
            "PublishRelease",
            all_consuming(map(packet_id, |packet_id| {
                Packet::PublishRelease(PublishRelease { packet_id })
            })),
        )(remaining),
        Type::PUBCOMP => context(
            "PublishComplete",
            all_consuming(map(packet_id, |packet_id| {
                Packet::PublishComplete(PublishComplete { packet_id })
            })),
        )(remaining),
        Type::SUBSCRIBE => context(
            "Subscribe",
            all_consuming(map(subscribe, Packet::Subscribe)),
        )(remaining),
        Type::SUBACK => context(
            "SubscribeAck",
            all_consuming(map(subscribe_ack, Packet::SubscribeAck)),
        )(remaining),
        Type::UNSUBSCRIBE => context(
            "Unsubscribe",
            all_consuming(map(unsubscribe, Packet::Unsubscribe)),
        )(remaining),
        Type::UNSUBACK => context(
            "UnsubscribeAck",
            all_consuming(map(packet_id, |packet_id| {
                Packet::UnsubscribeAck(UnsubscribeAck { packet_id })
            })),
        )(remaining),
        Type::PINGREQ => context("Ping", map(all_consuming(rest), |_| Packet::Ping))(remaining),
        Type::PINGRESP => context("Pong", map(all_consuming(rest), |_| Packet::Pong))(remaining),
        Type::DISCONNECT => {
            context("Disconnect", map(all_consuming(rest), |_| Packet::Disconnect))(remaining)
        }
    }
    .map(|(_, packet)| (input, packet))
}

fn connect<'a, E: ParseError<&'a [u8]>>(input: &'a [u8]) -> IResult<&'a [u8], Connect<'a>, E> {
    let (input, (_, protocol_level, flags, keep_alive)) = tuple((
        context("protocol name", tag(PROTOCOL_NAME)),
        context("protocol level", verify(be_u8, |&b| b == PROTOCOL_LEVEL)),
        context("flags", map_opt(be_u8, ConnectFlags::from_bits)),
        context("keepalive", be_u16),
    ))(input)?;

    let (input, (client_id, last_will, username, password)) = tuple((
        client_id,
        cond(
            flags.contains(ConnectFlags::LAST_WILL),
            context(
                "will",
                map(
                    tuple((
                        context("will topic", utf8_str),
                        context("will message", binary_data),
                    )),
                    |(topic_name, message)| LastWill {
                        qos: flags.qos(),
                        retain: flags.contains(ConnectFlags::WILL_RETAIN),
                        topic_name,
                        message,
                    },
                ),
            ),
        ),
        cond(
            flags.contains(ConnectFlags::USERNAME),
            context("username", utf8_str),
        ),
        cond(
            flags.contains(ConnectFlags::PASSWORD),
            context("password", binary_data),
        ),
    ))(input)?;

    Ok((
        input,
        Connect {
            protocol_level,
            clean_session: flags.contains(ConnectFlags::CLEAN_SESSION),
            keep_alive,
            client_id,
            last_will,
            username,
            password,
        },
    ))
}

fn connect_ack<'a, E: ParseError<&'a [u8]>>(input: &'a [u8]) -> IResult<&'a [u8], ConnectAck, E> {
    map(
        tuple((
            context("flags", map_opt(be_u8, ConnectAckFlags::from_bits)),
            context("return code", map_res(be_u8, ConnectReturnCode::try_from)),
        )),
        |(flags, return_code)| ConnectAck {
            session_present: flags.contains(ConnectAckFlags::SESSION_PRESENT),
            return_code,
        },
    )(input)
}

fn publish<'a, E: ParseError<&'a [u8]>>(
    input: &'a [u8],
    flags: PublishFlags,
) -> IResult<&'a [u8], Publish<'a>, E> {
    let dup = flags.contains(PublishFlags::DUP);
    let qos = flags.qos();
    let retain = flags.contains(PublishFlags::RETAIN);
    let (input, (topic_name, packet_id, payload)) = tuple((
        topic_name,
        cond(qos >= QoS::AtLeastOnce, packet_id),
        rest,
    ))(input)?;

    Ok((
        input,
        Publish {
            dup,
            qos,
            retain,
            topic_name,
            packet_id,
            payload,
        },
    ))
}

fn subscribe<'a, E: ParseError<&'a [u8]>>(input: &'a [u8]) -> IResult<&'a [u8], Subscribe<'a>, E> {
    map(
        tuple((packet_id, many1(subscription))),
        |(packet_id, subscriptions)| Subscribe {
            packet_id,
            subscriptions,
        },
    )(input)
}

fn subscribe_ack<'a, E: ParseError<&'a [u8]>>(
    input: &'a [u8],
) -> IResult<&'a [u8], SubscribeAck, E> {
    map(
        tuple((
            packet_id,
            many1(context(
                "return code",
                map_res(
                    be_u8,
                    |b| -> Result<_, num_enum::TryFromPrimitiveError<QoS>> {
                        if b == SubscribeAck::FAILURE {
                            Ok(SubscribeReturnCode::Failure)
                        } else {
                            QoS::try_from(b).map(SubscribeReturnCode::Success)
                        }
                    },
                ),
            )),
        )),
        |(packet_id, status)| SubscribeAck { packet_id, status },
    )(input)
}

fn unsubscribe<'a, E: ParseError<&'a [u8]>>(
    input: &'a [u8],
) -> IResult<&'a [u8], Unsubscribe<'a>, E> {
    map(
        tuple((packet_id, many1(topic_filter))),
        |(packet_id, topic_filters)| Unsubscribe {
            packet_id,
            topic_filters,
        },
    )(input)
}

#[cfg(test)]
mod tests {
    use matches::assert_matches;

    use super::*;

    #[test]
    fn test_fixed_header() {
        assert_eq!(
            FixedHeader::parse::<()>(b"\x20\x7f"),
            Ok((
                &b""[..],
                FixedHeader {
                    packet_type: Type::CONNACK,
                    packet_flags: 0,
                    remaining_length: 127,
                },
            ))
        );

        assert_eq!(
            FixedHeader::parse::<()>(b"\x3C\x82\x7f"),
            Ok((
                &b""[..],
                FixedHeader {
                    packet_type: Type::PUBLISH,
                    packet_flags: 0x0C,
                    remaining_length: 16258,
                },
            ))
        );

        assert_matches!(FixedHeader::parse::<()>(b"\x20"), Err(_));
    }

    #[test]
    fn test_varint() {
        macro_rules! assert_varint (
            ($bytes:expr, $res:expr) => {{
                assert_eq!(varint::<()>($bytes), Ok((&b""[..], $res)));
            }};

            ($bytes:expr, $res:expr, $rest:expr) => {{
                assert_eq!(varint::<()>($bytes), Ok((&$rest[..], $res)));
            }};
        );

        assert_varint!(b"\x7f\x7f", 127, b"\x7f");

        assert_matches!(varint::<()>(b"\xff\xff\xff"), Err(_));
        assert_matches!(varint::<()>(b"\xff\xff\xff\xff\xff\xff"), Err(_));

        assert_varint!(b"\x00", 0);
        assert_varint!(b"\x7f", 127);
        assert_varint!(b"\x80\x01", 128);
        assert_varint!(b"\xff\x7f", 16383);
        assert_varint!(b"\x80\x80\x01", 16384);
        assert_varint!(b"\xff\xff\x7f", 2097151);
        assert_varint!(b"\x80\x80\x80\x01", 2097152);
        assert_varint!(b"\xff\xff\xff\x7f", 268435455);
    }

    #[test]
    fn test_connect() {
        assert_eq!(
            connect::<()>(b"\x00\x04MQTT\x04\xC0\x00\x3C\x00\x0512345\x00\x04user\x00\x04pass"),
            Ok((
                &b""[..],
                Connect {
                    protocol_level: PROTOCOL_LEVEL,
                    clean_session: false,
                    keep_alive: 60,
                    client_id: "12345",
                    last_will: None,
                    username: Some("user"),
                    password: Some(b"pass"),
                },
            ))
        );

        assert_eq!(
            connect::<()>(b"\x00\x04MQTT\x04\x14\x00\x3C\x00\x0512345\x00\x05topic\x00\x07message"),
            Ok((
                &b""[..],
                Connect {
                    protocol_level: PROTOCOL_LEVEL,
                    clean_session: false,
                    keep_alive: 60,
                    client_id: "12345",
                    last_will: Some(LastWill {
                        qos: QoS::ExactlyOnce,
                        retain: false,
                        topic_name: "topic",
                        message: b"message",
                    }),
                    username: None,
                    password: None,
                },
            ))
        );

        // incomplete protocol name
        assert_matches!(connect::<()>(b"\x00\x02MQ"), Err(_));
        // invalid protocol name
        assert_matches!(connect::<()>(b"\x00\x04MQAA"), Err(_));
        // unsupported protocol level
        assert_matches!(connect::<()>(b"\x00\x04MQTT\x05"), Err(_));
        // invalid packet flags
        assert_matches!(connect::<()>(b"\x00\x04MQTT\x04\xff"), Err(_));
    }

    #[test]
    fn test_connect_ack() {
        assert_eq!(
            connect_ack::<()>(b"\x01\x04"),
            Ok((
                &b""[..],
                ConnectAck {
                    session_present: true,
                    return_code: ConnectReturnCode::BadUserNameOrPassword,
                }
            ))
        );

        // invalid flags
        assert_matches!(connect_ack::<()>(b"\x03\x04"), Err(_));
    }

    #[test]
    fn test_disconnect() {
        assert_eq!(parse(b"\xe0\x00"), Ok((&b""[..], Packet::Disconnect)));
    }

    #[test]
    fn test_publish() {
        assert_eq!(
            publish::<()>(b"\x00\x05topic\x12\x34hello", QoS::AtLeastOnce.into()),
            Ok((
                &b""[..],
                Publish {
                    dup: false,
                    qos: QoS::AtLeastOnce,
                    retain: false,
                    topic_name: "topic",
                    packet_id: Some(0x1234),
                    payload: b"hello",
                }
            ))
        );

        assert_eq!(
            parse(b"\x3d\x0D\x00\x05topic\x43\x21data"),
            Ok((
                &b""[..],
                Packet::Publish(Publish {
                    dup: true,
                    retain: true,
                    qos: QoS::ExactlyOnce,
                    topic_name: "topic",
                    packet_id: Some(0x4321),
                    payload: b"data",
                }),
            ))
        );
        assert_eq!(
            parse(b"\x30\x0b\x00\x05topicdata"),
            Ok((
                &b""[..],
                Packet::Publish(Publish {
                    dup: false,
                    retain: false,
                    qos: QoS::AtMostOnce,
                    topic_name: "topic",
                    packet_id: None,
                    payload: b"data",
                }),
            ))
        );

        assert_eq!(
            parse(b"\x40\x02\x43\x21"),
            Ok((
                &b""[..],
                Packet::PublishAck(PublishAck { packet_id: 0x4321 })
            ))
        );
        assert_eq!(
            parse(b"\x50\x02\x43\x21"),
            Ok((
                &b""[..],
                Packet::PublishReceived(PublishReceived { packet_id: 0x4321 })
            ))
        );
        assert_eq!(
            parse(b"\x62\x02\x43\x21"),
            Ok((
                &b""[..],
                Packet::PublishRelease(PublishRelease { packet_id: 0x4321 })
            ))
        );
        assert_eq!(
            parse(b"\x70\x02\x43\x21"),
            Ok((
                &b""[..],
                Packet::PublishComplete(PublishComplete { packet_id: 0x4321 })
            ))
        );
    }

    #[test]
    fn test_subscribe() {
        assert_eq!(
            subscribe::<()>(b"\x12\x34\x00\x04test\x01\x00\x06filter\x02"),
            Ok((
                &b""[..],
                Subscribe {
                    packet_id: 0x1234,
                    subscriptions: vec![("test", QoS::AtLeastOnce), ("filter", QoS::ExactlyOnce)],
                }
            ))
        );
        assert_eq!(
            parse(b"\x82\x12\x12\x34\x00\x04test\x01\x00\x06filter\x02"),
            Ok((
                &b""[..],
                Packet::Subscribe(Subscribe {
                    packet_id: 0x1234,
                    subscriptions: vec![("test", QoS::AtLeastOnce), ("filter", QoS::ExactlyOnce)],
                })
            ))
        );

        assert_eq!(
            subscribe_ack::<()>(b"\x12\x34\x01\x80\x02"),
            Ok((
                &b""[..],
                SubscribeAck {
                    packet_id: 0x1234,
                    status: vec![
                        SubscribeReturnCode::Success(QoS::AtLeastOnce),
                        SubscribeReturnCode::Failure,
                        SubscribeReturnCode::Success(QoS::ExactlyOnce),
                    ],
                }
            ))
        );

        assert_eq!(
            unsubscribe::<()>(b"\x12\x34\x00\x04test\x00\x06filter"),
            Ok((
                &b""[..],
                Unsubscribe {
                    packet_id: 0x1234,
                    topic_filters: vec!["test", "filter"],
                }
            ))
        );
        assert_eq!(
            parse(b"\xb0\x02\x43\x21"),
            Ok((
                &b""[..],
                Packet::UnsubscribeAck(UnsubscribeAck { packet_id: 0x4321 })
            ))
        );

        // subscribe without subscription topics
        assert_matches!(parse(b"\x82\x02\x42\x42"), Err(_));
        // no QoS for topic filter
        assert_matches!(parse(b"\x82\x04\x42\x42\x00\x00"), Err(_));
        // truncated string length prefix
        assert_matches!(parse(b"\x82\x03\x42\x42\x00"), Err(_));
        // unsubscribe without subscription topics
        assert_matches!(parse(b"\xa2\x02\x42\x42"), Err(_));
    }

    #[test]
    fn test_ping_pong() {
        assert_eq!(parse(b"\xc0\x00"), Ok((&b""[..], Packet::Ping)));
        assert_eq!(parse(b"\xd0\x00"), Ok((&b""[..], Packet::Pong)));
    }
}
