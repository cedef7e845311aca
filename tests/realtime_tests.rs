//! Realtime delivery tests: bus policy in-process, then the WebSocket
//! protocol end to end against a server on an ephemeral port.

use std::sync::Arc;
use std::time::{Duration, Instant};
use task_graph_live::realtime::{ChangeEvent, CloseReason, DeletedTask, EventBus, Room};
use task_graph_live::types::{Task, TaskStatus};

fn task(id: u64, assignee: Option<u64>) -> Task {
    Task {
        id,
        parent_id: None,
        title: format!("task {id}"),
        description: None,
        creator_id: 1,
        assignee_id: assignee,
        status: TaskStatus::Todo,
        created_at: 1,
        updated_at: 1,
        deleted_at: None,
    }
}

mod bus_tests {
    use super::*;

    #[test]
    fn slow_subscriber_is_dropped_after_capacity_plus_one() {
        let capacity = 8;
        let bus = EventBus::new(capacity);
        let slow = bus.subscribe().unwrap();
        let mut fast = bus.subscribe().unwrap();

        for id in 1..=capacity as u64 {
            let report = bus.publish(ChangeEvent::TaskCreated(task(id, None))).unwrap();
            assert_eq!(report.overrun, 0);
            // Keep the fast subscriber drained.
            assert_eq!(fast.try_recv().unwrap().task_id(), id);
        }
        assert_eq!(slow.close_reason(), CloseReason::Open);

        let report = bus
            .publish(ChangeEvent::TaskCreated(task(99, None)))
            .unwrap();
        assert_eq!(report.overrun, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(slow.close_reason(), CloseReason::Overrun);
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(fast.try_recv().unwrap().task_id(), 99);
    }

    #[test]
    fn overrun_discards_the_backlog() {
        let bus = EventBus::new(2);
        let mut slow = bus.subscribe().unwrap();
        for id in 1..=3 {
            bus.publish(ChangeEvent::TaskCreated(task(id, None))).unwrap();
        }
        assert!(slow.try_recv().is_none());
    }

    #[test]
    fn many_stalled_subscribers_do_not_stall_publishers() {
        let bus = EventBus::new(4);
        let stalled: Vec<_> = (0..50).map(|_| bus.subscribe().unwrap()).collect();

        let started = Instant::now();
        for id in 0..1_000 {
            bus.publish(ChangeEvent::TaskCreated(task(id, None))).unwrap();
        }
        assert!(started.elapsed() < Duration::from_secs(5));

        assert_eq!(bus.subscriber_count(), 0);
        assert!(
            stalled
                .iter()
                .all(|m| m.close_reason() == CloseReason::Overrun)
        );
    }

    #[test]
    fn per_subscriber_order_matches_publish_order() {
        let bus = EventBus::new(512);
        let mut a = bus.subscribe().unwrap();
        let mut b = bus.subscribe().unwrap();

        let publishers: Vec<_> = (0..4u64)
            .map(|p| {
                let bus = bus.clone();
                std::thread::spawn(move || {
                    for i in 0..100u64 {
                        bus.publish(ChangeEvent::TaskCreated(task(p * 1_000 + i, None)))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in publishers {
            handle.join().unwrap();
        }

        for mailbox in [&mut a, &mut b] {
            let mut last = [None::<u64>; 4];
            let mut count = 0;
            while let Some(event) = mailbox.try_recv() {
                let id = event.task_id();
                let producer = (id / 1_000) as usize;
                if let Some(prev) = last[producer] {
                    assert!(id > prev, "producer {producer} out of order");
                }
                last[producer] = Some(id);
                count += 1;
            }
            assert_eq!(count, 400);
        }
    }

    #[test]
    fn rooms_filter_targeted_events() {
        let bus = EventBus::new(16);
        let mut in_room = bus.subscribe().unwrap();
        let mut outside = bus.subscribe().unwrap();
        assert!(bus.join(in_room.id(), Room::User(7)));

        bus.publish(ChangeEvent::TaskAssigned(task(1, Some(7)))).unwrap();
        assert_eq!(in_room.try_recv().unwrap().kind(), "task_assigned");
        assert!(outside.try_recv().is_none());

        bus.leave(in_room.id(), Room::User(7));
        bus.leave(in_room.id(), Room::User(7));
        bus.publish(ChangeEvent::TaskAssigned(task(2, Some(7)))).unwrap();
        assert!(in_room.try_recv().is_none());
    }

    #[test]
    fn unsubscribe_drains_then_closes() {
        let bus = EventBus::new(16);
        let mut mailbox = bus.subscribe().unwrap();
        bus.publish(ChangeEvent::TaskDeleted(DeletedTask {
            id: 5,
            assignee_id: None,
        }))
        .unwrap();

        assert!(bus.unsubscribe(mailbox.id()));
        assert!(!bus.unsubscribe(mailbox.id()));
        bus.publish(ChangeEvent::TaskCreated(task(6, None))).unwrap();

        assert_eq!(mailbox.try_recv().unwrap().task_id(), 5);
        assert!(mailbox.try_recv().is_none());
        assert_eq!(mailbox.close_reason(), CloseReason::Unregistered);
    }

    #[test]
    fn dropping_a_mailbox_unregisters_it() {
        let bus = EventBus::new(4);
        let mailbox = bus.subscribe().unwrap();
        let id = mailbox.id();
        bus.join(id, Room::Task(3));
        assert_eq!(bus.sessions().room_size(Room::Task(3)), 1);

        drop(mailbox);
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.sessions().room_size(Room::Task(3)), 0);
        assert!(!bus.join(id, Room::Task(3)));
    }

    #[tokio::test]
    async fn shutdown_closes_waiting_receivers() {
        let bus = EventBus::new(4);
        let mut mailbox = bus.subscribe().unwrap();
        let waiter = tokio::spawn(async move {
            let next = mailbox.recv().await;
            (next.is_none(), mailbox.close_reason())
        });

        tokio::task::yield_now().await;
        bus.shutdown();

        let (closed, reason) = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("receiver woke up")
            .unwrap();
        assert!(closed);
        assert_eq!(reason, CloseReason::Shutdown);
        assert!(bus.subscribe().is_err());
    }
}

mod websocket_tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use serde_json::{Value, json};
    use task_graph_live::config::Config;
    use task_graph_live::db::Database;
    use task_graph_live::server::{AppState, ServerHandle, start_server};
    use task_graph_live::service::RegisterRequest;
    use task_graph_live::types::{Principal, TaskDraft, TaskPatch};
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    const SECRET: &str = "websocket-test-secret-0123456789abcdef";

    struct Server {
        handle: ServerHandle,
        state: AppState,
    }

    impl Server {
        fn url(&self) -> String {
            format!("ws://{}/api/v1/ws", self.handle.addr())
        }

        /// Register a user and return its token and principal.
        fn user(&self, name: &str) -> (String, Principal) {
            let response = self
                .state
                .accounts
                .register(RegisterRequest {
                    username: name.to_string(),
                    email: format!("{name}@x.io"),
                    password: "pw123456".to_string(),
                    display_name: name.to_string(),
                })
                .unwrap();
            let principal = Principal {
                user_id: response.user.id,
                email: response.user.email,
            };
            (response.token, principal)
        }
    }

    async fn start() -> Server {
        let mut config = Config::default();
        config.server.bind = "127.0.0.1".to_string();
        config.server.port = 0;
        config.auth.jwt_secret = SECRET.to_string();

        let db = Arc::new(Database::open_in_memory().unwrap());
        let state = AppState::new(db, &config);
        let handle = start_server(state.clone(), &config).await.unwrap();
        Server { handle, state }
    }

    async fn next_frame(client: &mut Client) -> Message {
        tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("read error")
    }

    async fn next_json(client: &mut Client) -> Value {
        loop {
            match next_frame(client).await {
                Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
                Message::Ping(_) | Message::Pong(_) => continue,
                other => panic!("expected a text frame, got {other:?}"),
            }
        }
    }

    async fn send_json(client: &mut Client, value: Value) {
        client
            .send(Message::text(value.to_string()))
            .await
            .unwrap();
    }

    /// Connect and authenticate, returning once the session is ready.
    async fn connect(server: &Server, token: &str) -> Client {
        let (mut client, _) = connect_async(server.url()).await.unwrap();
        let welcome = next_json(&mut client).await;
        assert_eq!(welcome["type"], "connected");

        send_json(&mut client, json!({"type": "authenticate", "token": token})).await;
        let reply = next_json(&mut client).await;
        assert_eq!(reply["type"], "authenticated", "{reply}");
        client
    }

    #[tokio::test]
    async fn authenticated_client_sees_changes() {
        let server = start().await;
        let (token, alice) = server.user("alice");
        let mut client = connect(&server, &token).await;

        let task = server
            .state
            .tasks
            .create(
                &alice,
                TaskDraft {
                    title: "live".to_string(),
                    ..Default::default()
                },
            )
            .unwrap();

        let created = next_json(&mut client).await;
        assert_eq!(created["type"], "task_created");
        assert_eq!(created["payload"]["id"], task.id);
        assert_eq!(created["payload"]["title"], "live");

        // join_task has no reply; a repeated authenticate acknowledges in
        // order, which proves the join was processed.
        send_json(
            &mut client,
            json!({"type": "join_task", "task_id": task.id.to_string()}),
        )
        .await;
        send_json(&mut client, json!({"type": "authenticate", "token": token})).await;
        assert_eq!(next_json(&mut client).await["type"], "authenticated");
        assert!(server.state.bus.sessions().room_size(Room::Task(task.id)) == 1);

        server
            .state
            .tasks
            .update(
                &alice,
                task.id,
                TaskPatch {
                    status: Some("done".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        let updated = next_json(&mut client).await;
        assert_eq!(updated["type"], "task_updated");
        assert_eq!(updated["payload"]["status"], "done");

        server.handle.shutdown().await;
    }

    #[tokio::test]
    async fn assignee_receives_assignment() {
        let server = start().await;
        let (_, alice) = server.user("alice");
        let (bob_token, bob) = server.user("bob");
        let mut bobs = connect(&server, &bob_token).await;

        server
            .state
            .tasks
            .create(
                &alice,
                TaskDraft {
                    title: "for bob".to_string(),
                    assignee_id: Some(bob.user_id),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(next_json(&mut bobs).await["type"], "task_created");
        let assigned = next_json(&mut bobs).await;
        assert_eq!(assigned["type"], "task_assigned");
        assert_eq!(assigned["payload"]["assignee_id"], bob.user_id);

        server.handle.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_token_gets_auth_error_then_close() {
        let server = start().await;
        let (mut client, _) = connect_async(server.url()).await.unwrap();
        assert_eq!(next_json(&mut client).await["type"], "connected");

        send_json(&mut client, json!({"type": "authenticate", "token": "bogus"})).await;
        let reply = next_json(&mut client).await;
        assert_eq!(reply["type"], "auth_error");
        assert_eq!(reply["payload"], "Invalid token");

        match next_frame(&mut client).await {
            Message::Close(_) => {}
            other => panic!("expected close, got {other:?}"),
        }

        server.handle.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_closes_sessions_with_going_away() {
        let server = start().await;
        let (token, _) = server.user("alice");
        let mut client = connect(&server, &token).await;
        assert_eq!(server.state.bus.subscriber_count(), 1);

        server.handle.shutdown().await;

        match next_frame(&mut client).await {
            Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Away),
            other => panic!("expected close, got {other:?}"),
        }
    }
}
