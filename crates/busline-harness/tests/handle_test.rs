//! Async access to a simulated connection through its owner thread.

use std::rc::Rc;

use busline_core::{
    Connection, ConnectionError, ConnectionHandle, EventBase, ServerAddress,
    mechanism::MechanismRegistry, transport::StreamTransport,
};
use busline_harness::{ScriptedBroker, SimEventBase, SimNetwork};
use busline_proto::{Message, MessageKind};

/// Builds the whole simulation on the owner thread.
fn open_simulated(broker: ScriptedBroker) -> Result<Connection, ConnectionError> {
    let network = SimNetwork::new();
    let event_base: Rc<dyn EventBase> = Rc::new(SimEventBase::new(network.clone()));
    let socket = network.connect(broker);

    let mut connection = Connection::new(
        ServerAddress::new("sim:name=broker"),
        Box::new(StreamTransport::new(socket)),
        event_base,
    );
    connection.handshake(&MechanismRegistry::default())?;
    Ok(connection)
}

fn chatty_broker() -> ScriptedBroker {
    ScriptedBroker::accepting(["EXTERNAL"], "guid").responding(Box::new(|call| {
        if call.kind != MessageKind::MethodCall {
            return Vec::new();
        }
        vec![Message::signal(&b"notice"[..]), Message::method_return(call.serial, call.body.clone())]
    }))
}

#[tokio::test]
async fn call_through_handle() {
    let handle = ConnectionHandle::spawn(|| open_simulated(chatty_broker())).await.unwrap();

    let reply = handle.call(Message::method_call(&b"ping"[..])).await.unwrap();
    assert_eq!(reply.kind, MessageKind::MethodReturn);
    assert_eq!(reply.reply_serial, Some(1));
    assert_eq!(&reply.body[..], b"ping");

    let serial = handle.send(Message::method_call(&b"fire"[..])).await.unwrap();
    assert_eq!(serial, 2);

    let drained = handle.drain_pending().await.unwrap();
    assert_eq!(drained.len(), 1);
    assert_eq!(drained[0].kind, MessageKind::Signal);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn clones_see_shutdown() {
    let handle = ConnectionHandle::spawn(|| open_simulated(chatty_broker())).await.unwrap();
    let other = handle.clone();

    handle.shutdown().await.unwrap();

    let result = other.call(Message::method_call(&b"late"[..])).await;
    assert_eq!(result, Err(ConnectionError::Closed));
    assert!(other.is_closed());
    assert_eq!(other.drain_pending().await, Err(ConnectionError::Closed));
}

#[tokio::test]
async fn open_failure_is_reported_to_spawner() {
    let result =
        ConnectionHandle::spawn(|| open_simulated(ScriptedBroker::scripted(["REJECTED"]))).await;

    assert!(matches!(result, Err(ConnectionError::Auth(_))), "got {result:?}");
}

#[tokio::test]
async fn connection_errors_reach_the_caller() {
    let handle = ConnectionHandle::spawn(|| {
        open_simulated(
            ScriptedBroker::accepting(["EXTERNAL"], "guid")
                .responding(busline_harness::broker::silent()),
        )
    })
    .await
    .unwrap();

    // Nothing will ever answer, and the simulation has no clock to wait on.
    let result = handle.call(Message::method_call(&b"void"[..])).await;
    assert!(matches!(result, Err(ConnectionError::Transport(_))), "got {result:?}");

    handle.shutdown().await.unwrap();
}
