//! Wire-format vector tests for the packet codec.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use wavelink_core::codec::{decode_packet_text, decode_payload, encode_packet, Encoded};
use wavelink_core::packet::{Packet, PacketType};

#[test]
fn open_packet_vector() {
    let p = decode_packet_text(
        "0{\"sid\":\"abc\",\"upgrades\":[\"websocket\"],\"pingInterval\":25000,\"pingTimeout\":5000}",
    )
    .unwrap();
    assert_eq!(p.ptype, PacketType::Open);
    let hs: wavelink_core::packet::Handshake =
        serde_json::from_str(p.data.as_text().unwrap()).unwrap();
    assert_eq!(hs.sid, "abc");
    assert_eq!(hs.upgrades, vec!["websocket".to_string()]);
    assert_eq!(hs.ping_interval, 25000);
    assert_eq!(hs.ping_timeout, 5000);
}

#[test]
fn upgrade_handshake_vectors() {
    // the probe exchange and commit, as seen on the candidate transport
    let probe = decode_packet_text("2probe").unwrap();
    assert_eq!(probe.ptype, PacketType::Ping);
    assert!(probe.is_probe());

    let Encoded::Text(reply) = encode_packet(&Packet::pong("probe"), true) else {
        panic!("expected text");
    };
    assert_eq!(reply, "3probe");

    let commit = decode_packet_text("5").unwrap();
    assert_eq!(commit.ptype, PacketType::Upgrade);
    assert!(commit.data.is_empty());
}

#[test]
fn polling_payload_vector() {
    let packets = decode_payload("6:4hello2:4\u{1f600}1:6").unwrap();
    assert_eq!(packets.len(), 3);
    assert_eq!(packets[0], Packet::message("hello"));
    assert_eq!(packets[1].data.as_text(), Some("\u{1f600}"));
    assert_eq!(packets[2].ptype, PacketType::Noop);
}

#[test]
fn close_and_noop_are_bare() {
    let Encoded::Text(close) = encode_packet(&Packet::close(), true) else {
        panic!("expected text");
    };
    assert_eq!(close, "1");
    let Encoded::Text(noop) = encode_packet(&Packet::noop(), true) else {
        panic!("expected text");
    };
    assert_eq!(noop, "6");
}
