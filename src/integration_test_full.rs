//! Full send/receive/reply/disconnect pipeline tests for the dispatch layer.
//!
//! Unlike the per-handler tests in `server.rs`'s own `#[cfg(test)] mod
//! tests` -- which exercise one `dispatch` call at a time -- this module
//! drives whole request/reply sequences across two or more sessions
//! against a single `Server`, proving the send, receive, reply-matching,
//! name-registry, and disconnect pipelines cooperate correctly end to
//! end. Self-contained helpers mirror `server.rs`'s own, kept separate so
//! this module has no dependency on that file's private test internals.

use std::thread;
use std::time::Duration;

use crate::bus::Bus;
use crate::config::Config;
use crate::control::{self, ControlReply, ControlRequest, NameListing};
use crate::notify::Notification;
use crate::policy::AllowAll;
use crate::protocol::{self, frame_type, msg_flags, Header, Item, RawFrame};
use crate::server::{dispatch, disconnect, encode_recv_request, Server, Session};

fn server() -> Server {
    Server::new(Bus::new(Box::new(AllowAll)), Config::default())
}

fn hello_frame(flags: u64) -> RawFrame {
    RawFrame { frame_type: frame_type::HELLO, payload: control::encode_request(&ControlRequest::Hello { flags, activator_name: None, label: None }) }
}

fn say_hello(server: &Server, session: &mut Session, flags: u64) -> u64 {
    let reply = dispatch(server, session, hello_frame(flags));
    match control::decode_reply(&reply.payload).unwrap() {
        ControlReply::Hello { id } => id,
        other => panic!("unexpected reply {other:?}"),
    }
}

fn send_frame(header: Header, items: &[Item]) -> RawFrame {
    RawFrame { frame_type: frame_type::SEND, payload: protocol::encode_message(header, items) }
}

fn recv_frame(flags: u64, floor: Option<i64>) -> RawFrame {
    RawFrame { frame_type: frame_type::RECV, payload: encode_recv_request(flags, floor) }
}

fn blank_header(dst: u64, cookie: u64, flags: u64) -> Header {
    Header { size: 0, flags, dst_id: dst, src_id: 0, cookie, timeout_ns: 0, cookie_reply: 0, priority: 0, offset_reply: 0 }
}

#[test]
fn send_then_recv_round_trips_a_payload() {
    let server = server();
    let mut sender = Session::new();
    let mut receiver = Session::new();
    say_hello(&server, &mut sender, 0);
    let receiver_id = say_hello(&server, &mut receiver, 0);

    let header = blank_header(receiver_id, 1, 0);
    let reply = dispatch(&server, &mut sender, send_frame(header, &[Item::PayloadVec(b"hi".to_vec())]));
    assert_eq!(reply.frame_type, frame_type::SEND_REPLY);
    assert_eq!(reply.payload[0], protocol::status::OK);

    let reply = dispatch(&server, &mut receiver, recv_frame(0, None));
    assert_eq!(reply.frame_type, frame_type::RECV_REPLY);
    assert_eq!(reply.payload[0], protocol::status::OK);
    let (header, items) = protocol::decode_message(&reply.payload[2..]).unwrap();
    assert_eq!(header.cookie, 1);
    match &items[0] {
        Item::PayloadVec(bytes) => assert_eq!(bytes, b"hi"),
        other => panic!("unexpected item {other:?}"),
    }
}

/// Drives a synchronous `SEND` on one session while a second thread
/// polls the responder's `RECV` until the request arrives, then answers
/// it -- proving the full round trip through `send.rs`'s sync-wait path
/// and back through `recv.rs`'s single-message install (§4.4 step 10).
#[test]
fn synchronous_send_blocks_until_the_peer_replies() {
    let server = server();
    let mut requester = Session::new();
    let mut responder = Session::new();
    let requester_id = say_hello(&server, &mut requester, 0);
    say_hello(&server, &mut responder, 0);
    let responder_conn = responder.connection().unwrap().clone();

    let server_clone = server.clone();
    let handle = thread::spawn(move || loop {
        let reply = dispatch(&server_clone, &mut responder, recv_frame(0, None));
        if reply.payload[0] != protocol::status::OK {
            thread::sleep(Duration::from_millis(5));
            continue;
        }
        let (request_header, _) = protocol::decode_message(&reply.payload[2..]).unwrap();
        let mut reply_header = blank_header(requester_id, 99, 0);
        reply_header.cookie_reply = request_header.cookie;
        dispatch(&server_clone, &mut responder, send_frame(reply_header, &[Item::PayloadVec(b"pong".to_vec())]));
        break;
    });

    let flags = msg_flags::EXPECT_REPLY | msg_flags::SYNC_REPLY;
    let mut header = blank_header(responder_conn.id, 1, flags);
    header.timeout_ns = Duration::from_secs(5).as_nanos() as u64;
    let reply = dispatch(&server, &mut requester, send_frame(header, &[Item::PayloadVec(b"ping".to_vec())]));
    handle.join().unwrap();

    assert_eq!(reply.payload[0], protocol::status::OK);
    let (_, items) = protocol::decode_message(&reply.payload[2..]).unwrap();
    match &items[0] {
        Item::PayloadVec(bytes) => assert_eq!(bytes, b"pong"),
        other => panic!("unexpected item {other:?}"),
    }
}

/// Drives `NAME_ACQUIRE` -> `NAME_LIST` -> `NAME_RELEASE` as a single
/// control-frame sequence against one connection.
#[test]
fn name_acquire_release_and_list_round_trip_through_control_frames() {
    let server = server();
    let mut session = Session::new();
    say_hello(&server, &mut session, 0);

    let acquire = RawFrame {
        frame_type: frame_type::NAME_ACQUIRE,
        payload: control::encode_request(&ControlRequest::NameAcquire { name: "com.example.Svc".into(), flags: 0 }),
    };
    let reply = dispatch(&server, &mut session, acquire);
    match control::decode_reply(&reply.payload).unwrap() {
        ControlReply::NameAcquireOwner { sequence } => assert_eq!(sequence, 1),
        other => panic!("unexpected reply {other:?}"),
    }

    let list = RawFrame { frame_type: frame_type::NAME_LIST, payload: control::encode_request(&ControlRequest::NameList) };
    let reply = dispatch(&server, &mut session, list);
    match control::decode_reply(&reply.payload).unwrap() {
        ControlReply::NameList { names } => assert_eq!(names, vec![NameListing { name: "com.example.Svc".into(), owner: Some(1), activator: None }]),
        other => panic!("unexpected reply {other:?}"),
    }

    let release = RawFrame {
        frame_type: frame_type::NAME_RELEASE,
        payload: control::encode_request(&ControlRequest::NameRelease { name: "com.example.Svc".into() }),
    };
    let reply = dispatch(&server, &mut session, release);
    assert!(matches!(control::decode_reply(&reply.payload).unwrap(), ControlReply::NameReleaseOk));
}

/// Drives a full disconnect: a peer with an outstanding synchronous
/// reply expectation must see `ReplyDead` followed by `IdRemove` once
/// the connection it was waiting on drops (§4.7).
#[test]
fn disconnect_delivers_reply_dead_then_id_remove_to_the_waiting_sender() {
    let server = server();
    let mut a = Session::new();
    let mut b = Session::new();
    say_hello(&server, &mut a, 0);
    let b_id = say_hello(&server, &mut b, 0);
    let b_conn = b.connection().unwrap().clone();

    let header = blank_header(b_id, 1, msg_flags::EXPECT_REPLY);
    let reply = dispatch(&server, &mut a, send_frame(header, &[]));
    assert_eq!(reply.payload[0], protocol::status::OK);

    disconnect(&server, &b_conn).unwrap();

    let reply = dispatch(&server, &mut a, recv_frame(0, None));
    assert_eq!(reply.payload[0], protocol::status::OK);
    let (_, items) = protocol::decode_message(&reply.payload[2..]).unwrap();
    let note = items.iter().find_map(|i| match i {
        Item::Metadata(bytes) => Some(Notification::decode(bytes).unwrap()),
        _ => None,
    });
    assert_eq!(note, Some(Notification::ReplyDead { cookie: 1 }));

    let reply = dispatch(&server, &mut a, recv_frame(0, None));
    let (_, items) = protocol::decode_message(&reply.payload[2..]).unwrap();
    let note = items.iter().find_map(|i| match i {
        Item::Metadata(bytes) => Some(Notification::decode(bytes).unwrap()),
        _ => None,
    });
    assert_eq!(note, Some(Notification::IdRemove { id: b_id }));
}
