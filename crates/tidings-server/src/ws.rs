//! WebSocket upgrade and per-connection loop.

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use tracing::debug;

use tidings_shared::protocol::{ClientFrame, ServerFrame};

use crate::api::AppState;
use crate::service::SendRequest;
use crate::transport::{ConnectionId, ConnectionState, JoinOutcome};

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| ws_connection(socket, state))
}

async fn ws_connection(mut socket: WebSocket, state: AppState) {
    let (conn, mut outbox) = state.hub.connect().await;

    loop {
        tokio::select! {
            frame = outbox.recv() => {
                let Some(frame) = frame else { break };
                if send_frame(&mut socket, &frame).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        let reply = match serde_json::from_str::<ClientFrame>(&text) {
                            Ok(frame) => handle_frame(&state, conn, frame).await,
                            Err(e) => error_frame(format!("unreadable frame: {e}")),
                        };
                        if send_frame(&mut socket, &reply).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                    // Pings are answered by the socket itself.
                    _ => {}
                }
            }
        }
    }

    state.hub.disconnect(conn).await;
}

async fn send_frame(socket: &mut WebSocket, frame: &ServerFrame) -> Result<(), axum::Error> {
    match serde_json::to_string(frame) {
        Ok(json) => socket.send(WsMessage::Text(json)).await,
        Err(e) => {
            debug!(error = %e, "dropping unencodable frame");
            Ok(())
        }
    }
}

fn error_frame(message: impl Into<String>) -> ServerFrame {
    ServerFrame::Error {
        message: message.into(),
    }
}

/// Apply one client frame to connection `conn` and produce the direct reply.
pub async fn handle_frame(state: &AppState, conn: ConnectionId, frame: ClientFrame) -> ServerFrame {
    match frame {
        ClientFrame::Join { user_id } => match state.hub.join(conn, user_id.clone()).await {
            Ok(JoinOutcome::Joined | JoinOutcome::AlreadyJoined) => ServerFrame::Joined { user_id },
            Ok(JoinOutcome::Rejected { bound_to }) => {
                error_frame(format!("connection is already joined as {bound_to}"))
            }
            Err(e) => error_frame(e.to_string()),
        },
        ClientFrame::JoinGroup { group_id } => {
            match state.hub.join_group(conn, group_id.clone()).await {
                Ok(Some(_)) => ServerFrame::GroupJoined { group_id },
                Ok(None) => error_frame("join before entering a group"),
                Err(e) => error_frame(e.to_string()),
            }
        }
        ClientFrame::Message {
            receiver_id,
            body,
            attachments,
        } => {
            send_as_joined(state, conn, move |sender_id| SendRequest {
                sender_id,
                receiver_id: Some(receiver_id),
                group_id: None,
                body,
                attachments,
            })
            .await
        }
        ClientFrame::GroupMessage {
            group_id,
            body,
            attachments,
        } => {
            send_as_joined(state, conn, move |sender_id| SendRequest {
                sender_id,
                receiver_id: None,
                group_id: Some(group_id),
                body,
                attachments,
            })
            .await
        }
    }
}

async fn send_as_joined(
    state: &AppState,
    conn: ConnectionId,
    build: impl FnOnce(tidings_shared::UserId) -> SendRequest,
) -> ServerFrame {
    let ConnectionState::Joined(sender) = state.hub.state_of(conn).await else {
        return error_frame("join before sending");
    };
    match state.messenger.send(build(sender)).await {
        Ok(receipt) => ServerFrame::Sent(receipt),
        Err(e) => error_frame(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tidings_shared::{GroupId, Role};

    use super::*;
    use crate::testkit::{user, Fixture};

    #[tokio::test]
    async fn live_session() {
        let fx = Fixture::new().await;
        fx.add_user("alice", Role::Student).await;
        fx.add_user("bob", Role::Student).await;
        let state = fx.state.clone();

        let (alice, _alice_rx) = state.hub.connect().await;
        let (bob, mut bob_rx) = state.hub.connect().await;

        let early = handle_frame(
            &state,
            alice,
            ClientFrame::Message {
                receiver_id: user("bob"),
                body: "too soon".into(),
                attachments: Vec::new(),
            },
        )
        .await;
        assert!(matches!(early, ServerFrame::Error { .. }));

        let joined = handle_frame(&state, alice, ClientFrame::Join { user_id: user("alice") }).await;
        assert_eq!(joined, ServerFrame::Joined { user_id: user("alice") });
        handle_frame(&state, bob, ClientFrame::Join { user_id: user("bob") }).await;

        let hijack = handle_frame(&state, alice, ClientFrame::Join { user_id: user("bob") }).await;
        assert!(matches!(hijack, ServerFrame::Error { .. }));

        let reply = handle_frame(
            &state,
            alice,
            ClientFrame::Message {
                receiver_id: user("bob"),
                body: "hello bob".into(),
                attachments: Vec::new(),
            },
        )
        .await;
        assert!(matches!(reply, ServerFrame::Sent(_)));

        let delivered = tokio::time::timeout(Duration::from_secs(1), bob_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match delivered {
            ServerFrame::Message(m) => {
                assert_eq!(m.sender_id, user("alice"));
                assert_eq!(m.content, "hello bob");
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn group_room_delivery() {
        let fx = Fixture::new().await;
        fx.add_user("t1", Role::Teacher).await;
        fx.add_user("s1", Role::Student).await;
        let state = fx.state.clone();
        let group = state
            .messenger
            .create_group(crate::service::CreateGroupRequest {
                admin_id: user("t1"),
                name: "Geometry".into(),
                member_ids: vec![user("s1")],
            })
            .await
            .unwrap();

        let (teacher, _teacher_rx) = state.hub.connect().await;
        let (student, mut student_rx) = state.hub.connect().await;
        handle_frame(&state, teacher, ClientFrame::Join { user_id: user("t1") }).await;
        handle_frame(&state, student, ClientFrame::Join { user_id: user("s1") }).await;
        let entered = handle_frame(
            &state,
            student,
            ClientFrame::JoinGroup {
                group_id: group.id.clone(),
            },
        )
        .await;
        assert_eq!(
            entered,
            ServerFrame::GroupJoined {
                group_id: group.id.clone()
            }
        );

        let reply = handle_frame(
            &state,
            teacher,
            ClientFrame::GroupMessage {
                group_id: group.id.clone(),
                body: "quiz tomorrow".into(),
                attachments: Vec::new(),
            },
        )
        .await;
        assert!(matches!(reply, ServerFrame::Sent(_)));

        let delivered = tokio::time::timeout(Duration::from_secs(1), student_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(delivered, ServerFrame::GroupMessage(m) if m.content == "quiz tomorrow"));

        let outsider = GroupId::parse("other").unwrap();
        let refused = handle_frame(
            &state,
            student,
            ClientFrame::GroupMessage {
                group_id: outsider,
                body: "hi".into(),
                attachments: Vec::new(),
            },
        )
        .await;
        assert!(matches!(refused, ServerFrame::Error { .. }));
    }
}
