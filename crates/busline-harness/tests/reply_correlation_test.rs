//! Reply correlation over the simulated event base.
//!
//! Replies are claimed exactly once, unmatched messages stay queued until
//! drained, and a dispatch pass services every connection on the event base.

use std::{rc::Rc, time::Duration};

use busline_core::{
    Connection, ConnectionError, EventBase, ServerAddress, mechanism::MechanismRegistry,
    transport::StreamTransport,
};
use busline_harness::{ScriptedBroker, SimEnv, SimEventBase, SimNetwork, broker};
use busline_proto::{Message, MessageKind, ProtocolError};
use proptest::prelude::*;

fn establish(
    network: &SimNetwork,
    event_base: &Rc<SimEventBase>,
    broker: ScriptedBroker,
) -> Connection {
    let socket = network.connect(broker);
    let shared: Rc<dyn EventBase> = event_base.clone();
    let mut connection = Connection::new(
        ServerAddress::new("sim:name=broker"),
        Box::new(StreamTransport::new(socket)),
        shared,
    );
    connection.handshake(&MechanismRegistry::default()).expect("handshake should succeed");
    connection
}

fn echo_broker() -> ScriptedBroker {
    ScriptedBroker::accepting(["EXTERNAL"], "guid")
}

fn silent_broker() -> ScriptedBroker {
    echo_broker().responding(broker::silent())
}

fn world(broker: ScriptedBroker) -> (SimNetwork, Rc<SimEventBase>, Connection) {
    let network = SimNetwork::new();
    let event_base = Rc::new(SimEventBase::new(network.clone()));
    let connection = establish(&network, &event_base, broker);
    (network, event_base, connection)
}

#[test]
fn call_returns_matching_reply() {
    let (_network, _base, mut connection) = world(echo_broker());

    let reply = connection.call(Message::method_call(&b"ping"[..])).unwrap();

    assert_eq!(reply.kind, MessageKind::MethodReturn);
    assert_eq!(reply.reply_serial, Some(1));
    assert_eq!(&reply.body[..], b"ping");
    assert_eq!(connection.pending_len(), 0);
}

#[test]
fn exchange_transcript() {
    let (network, _base, mut connection) = world(echo_broker());

    connection.call(Message::method_call(&b"one"[..])).unwrap();
    connection.call(Message::method_call(&b"two"[..])).unwrap();

    let transcript = network.transcript(connection.descriptor());
    let frames: Vec<&str> = transcript
        .iter()
        .skip_while(|entry| *entry != "C: BEGIN")
        .skip(1)
        .map(String::as_str)
        .collect();
    insta::assert_snapshot!(frames.join("\n"), @r"
    C: method_call serial=1 body=one
    S: method_return serial=1 reply_serial=1 body=one
    C: method_call serial=2 body=two
    S: method_return serial=2 reply_serial=2 body=two
    ");
}

#[test]
fn signals_stay_queued_until_drained() {
    let broker = echo_broker().responding(Box::new(|call| {
        vec![
            Message::signal(&b"tick"[..]),
            Message::method_return(call.serial, &b"pong"[..]),
            Message::signal(&b"tock"[..]),
        ]
    }));
    let (_network, base, mut connection) = world(broker);

    let serial = connection.send_request(Message::method_call(&b"ping"[..])).unwrap();
    let reply = connection.wait_for_reply(serial).unwrap();
    assert_eq!(&reply.body[..], b"pong");
    assert_eq!(base.passes(), 2);

    let drained = connection.drain_pending();
    let bodies: Vec<&[u8]> = drained.iter().map(|m| &m.body[..]).collect();
    assert_eq!(bodies, [&b"tick"[..]]);
    assert!(connection.drain_pending().is_empty());
}

#[test]
fn drain_twice_yields_messages_then_nothing() {
    let (network, base, mut connection) = world(silent_broker());
    let descriptor = connection.descriptor();

    network.inject(descriptor, &Message::signal(&b"a"[..]).with_serial(1));
    network.inject(descriptor, &Message::signal(&b"b"[..]).with_serial(2));
    base.dispatch_once().unwrap();
    base.dispatch_once().unwrap();

    let first = connection.drain_pending();
    let second = connection.drain_pending();

    assert_eq!(first.iter().map(|m| m.serial).collect::<Vec<_>>(), [1, 2]);
    assert!(second.is_empty());
    assert_eq!(connection.pending_len(), 0);
}

#[test]
fn replies_are_matched_out_of_order() {
    let (network, base, mut connection) = world(silent_broker());
    let descriptor = connection.descriptor();

    let first = connection.send_request(Message::method_call(&b"1"[..])).unwrap();
    let second = connection.send_request(Message::method_call(&b"2"[..])).unwrap();

    network.inject(descriptor, &Message::method_return(second, &b"two"[..]).with_serial(10));
    network.inject(descriptor, &Message::error(first, &b"one"[..]).with_serial(11));

    let reply = connection.wait_for_reply(first).unwrap();
    assert_eq!(reply.kind, MessageKind::Error);
    assert_eq!(&reply.body[..], b"one");
    assert_eq!(connection.pending_len(), 1);

    let passes = base.passes();
    let reply = connection.wait_for_reply(second).unwrap();
    assert_eq!(&reply.body[..], b"two");
    assert_eq!(base.passes(), passes, "queued reply must not need a dispatch pass");
}

#[test]
fn claimed_reply_is_not_returned_twice() {
    let (_network, _base, mut connection) = world(echo_broker());

    let serial = connection.send_request(Message::method_call(&b"x"[..])).unwrap();
    connection.wait_for_reply(serial).unwrap();

    // Nothing else is in flight, so the second wait runs out of simulation
    // instead of returning the same message again.
    let again = connection.wait_for_reply(serial);
    assert!(matches!(again, Err(ConnectionError::Transport(_))), "got {again:?}");
}

#[test]
fn signal_with_reply_serial_is_not_a_reply() {
    let (network, _base, mut connection) = world(silent_broker());
    let descriptor = connection.descriptor();

    let serial = connection.send_request(Message::method_call(&b"x"[..])).unwrap();
    let mut impostor = Message::signal(&b"impostor"[..]).with_serial(20);
    impostor.reply_serial = Some(serial);
    network.inject(descriptor, &impostor);
    network.inject(descriptor, &Message::method_return(serial, &b"real"[..]).with_serial(21));

    let reply = connection.wait_for_reply(serial).unwrap();
    assert_eq!(&reply.body[..], b"real");
    assert_eq!(connection.drain_pending(), [impostor]);
}

#[test]
fn frames_behind_final_handshake_line_are_not_lost() {
    let network = SimNetwork::new();
    let event_base = Rc::new(SimEventBase::new(network.clone()));
    let socket = network.connect(ScriptedBroker::scripted(["OK g"]));
    let descriptor = busline_core::transport::Socket::descriptor(&socket);

    network.inject(descriptor, &Message::signal(&b"early"[..]).with_serial(1));

    let shared: Rc<dyn EventBase> = event_base.clone();
    let mut connection = Connection::new(
        ServerAddress::new("sim:name=broker"),
        Box::new(StreamTransport::new(socket)),
        shared,
    )
    .with_config(busline_core::ConnectionConfig {
        negotiate_unix_fd: false,
        ..Default::default()
    });
    connection
        .authenticate(vec![Box::new(busline_core::mechanism::External::new(Some("0".into())))])
        .unwrap();

    assert_eq!(event_base.passes(), 0);
    let queued = connection.drain_pending();
    assert_eq!(queued.len(), 1);
    assert_eq!(&queued[0].body[..], b"early");
}

#[test]
fn other_connections_are_serviced_while_waiting() {
    let network = SimNetwork::new();
    let event_base = Rc::new(SimEventBase::new(network.clone()));
    let mut a = establish(&network, &event_base, echo_broker());
    let mut b = establish(&network, &event_base, echo_broker());

    let serial_a = a.send_request(Message::method_call(&b"a"[..])).unwrap();
    let serial_b = b.send_request(Message::method_call(&b"b"[..])).unwrap();

    a.wait_for_reply(serial_a).unwrap();
    assert_eq!(b.pending_len(), 1, "b's reply arrived during a's dispatch pass");

    let passes = event_base.passes();
    assert_eq!(&b.wait_for_reply(serial_b).unwrap().body[..], b"b");
    assert_eq!(event_base.passes(), passes);
}

#[test]
fn peer_close_is_fatal_and_sticky() {
    let (network, base, mut connection) = world(silent_broker());
    let descriptor = connection.descriptor();

    let serial = connection.send_request(Message::method_call(&b"x"[..])).unwrap();
    network.close_peer(descriptor);

    assert_eq!(connection.wait_for_reply(serial), Err(ConnectionError::PeerClosed));
    assert!(!base.is_registered(descriptor));
    assert_eq!(connection.wait_for_reply(serial), Err(ConnectionError::PeerClosed));
    assert_eq!(connection.receive_no_hang(), Err(ConnectionError::PeerClosed));
}

#[test]
fn messages_before_failure_are_still_delivered() {
    let (network, _base, mut connection) = world(silent_broker());
    let descriptor = connection.descriptor();

    let serial = connection.send_request(Message::method_call(&b"x"[..])).unwrap();
    network.inject(descriptor, &Message::method_return(serial, &b"ok"[..]).with_serial(5));
    network.close_peer(descriptor);

    assert_eq!(&connection.wait_for_reply(serial).unwrap().body[..], b"ok");
}

#[test]
fn malformed_frame_is_a_protocol_error() {
    let (network, _base, mut connection) = world(silent_broker());
    let descriptor = connection.descriptor();

    let serial = connection.send_request(Message::method_call(&b"x"[..])).unwrap();
    network.inject_bytes(descriptor, &[b'l'; 16]);

    assert_eq!(
        connection.wait_for_reply(serial),
        Err(ConnectionError::Protocol(ProtocolError::InvalidEndianness(b'l')))
    );
}

#[test]
fn receive_no_hang_reads_directly() {
    let (network, base, mut connection) = world(silent_broker());
    let descriptor = connection.descriptor();

    assert_eq!(connection.receive_no_hang(), Ok(None));

    network.inject(descriptor, &Message::signal(&b"s"[..]).with_serial(3));
    network.deliver_pass();

    let message = connection.receive_no_hang().unwrap().expect("message should be available");
    assert_eq!(message.serial, 3);
    assert_eq!(connection.pending_len(), 0);
    assert_eq!(base.passes(), 0);
}

#[test]
fn wait_with_deadline_times_out_in_virtual_time() {
    let network = SimNetwork::new();
    let env = SimEnv::new();
    let tick = Duration::from_millis(10);
    let event_base = Rc::new(SimEventBase::new(network.clone()).with_clock(env.clone(), tick));
    let mut connection = establish(&network, &event_base, silent_broker());

    let serial = connection.send_request(Message::method_call(&b"x"[..])).unwrap();
    let result = connection.wait_for_reply_within(serial, &env, Duration::from_millis(50));

    let error = result.unwrap_err();
    assert_eq!(error, ConnectionError::ReplyTimeout { serial, elapsed: Duration::from_millis(50) });
    assert!(error.is_transient());
    assert_eq!(event_base.passes(), 5);
}

#[test]
fn queued_reply_beats_zero_deadline() {
    let (network, base, mut connection) = world(silent_broker());
    let descriptor = connection.descriptor();

    let serial = connection.send_request(Message::method_call(&b"x"[..])).unwrap();
    network.inject(descriptor, &Message::method_return(serial, &b"fast"[..]).with_serial(2));
    base.dispatch_once().unwrap();

    let reply = connection.wait_for_reply_within(serial, &SimEnv::new(), Duration::ZERO).unwrap();
    assert_eq!(&reply.body[..], b"fast");
}

#[test]
fn close_deregisters_and_shuts_down_once() {
    let (network, base, mut connection) = world(echo_broker());
    let descriptor = connection.descriptor();
    assert!(base.is_registered(descriptor));

    connection.close().unwrap();
    connection.close().unwrap();
    drop(connection);

    assert!(!base.is_registered(descriptor));
    assert_eq!(network.client_shutdowns(descriptor), 1);
}

#[test]
fn drop_closes_connection() {
    let (network, base, connection) = world(echo_broker());
    let descriptor = connection.descriptor();

    drop(connection);

    assert!(!base.is_registered(descriptor));
    assert_eq!(network.client_shutdowns(descriptor), 1);
}

#[test]
fn closed_connection_refuses_work() {
    let (_network, _base, mut connection) = world(echo_broker());
    connection.close().unwrap();

    assert_eq!(connection.send(b"x"), Err(ConnectionError::Closed));
    assert_eq!(connection.wait_for_reply(1), Err(ConnectionError::Closed));
    assert_eq!(
        connection.send_request(Message::method_call(&b"x"[..])),
        Err(ConnectionError::Closed)
    );
}

#[test]
fn unassigned_serial_cannot_be_sent() {
    let (_network, _base, mut connection) = world(echo_broker());

    let result = connection.send_message(&Message::method_call(&b"x"[..]));
    assert_eq!(result, Err(ConnectionError::Protocol(ProtocolError::ZeroSerial)));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn every_reply_is_claimed_exactly_once(
        order in (1usize..8).prop_flat_map(|n| Just((0..n).collect::<Vec<_>>()).prop_shuffle()),
        signals in 0usize..4,
    ) {
        let (network, _base, mut connection) = world(silent_broker());
        let descriptor = connection.descriptor();

        let serials: Vec<u32> = (0..order.len())
            .map(|i| connection.send_request(Message::method_call(vec![i as u8])).unwrap())
            .collect();

        for s in 0..signals {
            network.inject(descriptor, &Message::signal(&b"noise"[..]).with_serial(1000 + s as u32));
        }
        for (i, &index) in order.iter().enumerate() {
            let reply = Message::method_return(serials[index], vec![index as u8]);
            network.inject(descriptor, &reply.with_serial(100 + i as u32));
        }

        for (index, &serial) in serials.iter().enumerate() {
            let reply = connection.wait_for_reply(serial).unwrap();
            prop_assert_eq!(reply.reply_serial, Some(serial));
            prop_assert_eq!(&reply.body[..], &[index as u8][..]);
        }

        let leftovers = connection.drain_pending();
        prop_assert_eq!(leftovers.len(), signals);
        prop_assert!(leftovers.iter().all(|m| m.kind == MessageKind::Signal));
    }
}
