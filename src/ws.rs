use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::{Mutex, broadcast, mpsc};

use crate::ai::QuestionGenerator;
use crate::config::ServerConfig;
use crate::dots::{self, DotsCommand};
use crate::game::{self, RoomCommand, RoomSettings};
use crate::registry::{DotsHandle, Registry, RoomEvent, RoomHandle};
use crate::types::*;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub config: Arc<ServerConfig>,
    pub generator: Option<Arc<QuestionGenerator>>,
}

/// The room this socket is attached to, if any.
#[derive(Clone)]
enum Binding {
    Quiz(RoomHandle),
    Dots(DotsHandle),
}

impl Binding {
    fn event_tx(&self) -> &broadcast::Sender<RoomEvent> {
        match self {
            Binding::Quiz(h) => &h.event_tx,
            Binding::Dots(h) => &h.event_tx,
        }
    }

    async fn send_disconnect(&self, socket_id: &str) {
        match self {
            Binding::Quiz(h) => {
                let _ = h
                    .cmd_tx
                    .send(RoomCommand::Disconnect {
                        socket_id: socket_id.to_string(),
                    })
                    .await;
            }
            Binding::Dots(h) => {
                let _ = h
                    .cmd_tx
                    .send(DotsCommand::Disconnect {
                        socket_id: socket_id.to_string(),
                    })
                    .await;
            }
        }
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let client_id = params.get("clientId").cloned().unwrap_or_default();
    ws.on_upgrade(move |socket| handle_socket(socket, state, client_id))
}

async fn handle_socket(socket: WebSocket, state: AppState, client_id: String) {
    let (sender, mut receiver) = socket.split();
    let sender = Arc::new(Mutex::new(sender));

    let socket_id = uuid::Uuid::new_v4().to_string();
    tracing::info!("WebSocket connected: {} client: {}", socket_id, client_id);

    // Track which room this socket is subscribed to for broadcasting
    let binding: Arc<Mutex<Option<Binding>>> = Arc::new(Mutex::new(None));

    // Subscriptions are made by the session task and handed over ready-made,
    // so the receiver exists before any join command reaches the room task
    // and the acknowledgment broadcasts cannot outrun it.
    let (sub_tx, mut sub_rx) = mpsc::unbounded_channel::<broadcast::Receiver<RoomEvent>>();

    // Spawn a task that listens for room events and forwards to this socket
    let sender_clone = sender.clone();
    let socket_id_clone = socket_id.clone();
    let binding_clone = binding.clone();

    let event_task = tokio::spawn(async move {
        enum Step {
            Bind(Option<broadcast::Receiver<RoomEvent>>),
            Event(Result<RoomEvent, broadcast::error::RecvError>),
        }

        let mut event_rx: Option<broadcast::Receiver<RoomEvent>> = None;
        loop {
            let step = match event_rx.take() {
                None => Step::Bind(sub_rx.recv().await),
                Some(mut rx) => {
                    let step = tokio::select! {
                        next = sub_rx.recv() => Step::Bind(next),
                        event = rx.recv() => Step::Event(event),
                    };
                    if matches!(step, Step::Event(_)) {
                        event_rx = Some(rx);
                    }
                    step
                }
            };

            match step {
                // A rebind drops the old room's subscription on the spot
                Step::Bind(Some(rx)) => event_rx = Some(rx),
                Step::Bind(None) => return,
                Step::Event(Ok(event)) => {
                    let should_send = match &event {
                        RoomEvent::SendTo { socket_id, .. } => *socket_id == socket_id_clone,
                        RoomEvent::Broadcast { .. } => true,
                        RoomEvent::BroadcastExcept { exclude, .. } => *exclude != socket_id_clone,
                        RoomEvent::Kick { socket_id, .. } => *socket_id == socket_id_clone,
                    };

                    if should_send {
                        let kicked = matches!(&event, RoomEvent::Kick { .. });
                        let msg = match &event {
                            RoomEvent::SendTo { msg, .. }
                            | RoomEvent::Broadcast { msg, .. }
                            | RoomEvent::BroadcastExcept { msg, .. }
                            | RoomEvent::Kick { msg, .. } => msg,
                        };

                        if let Ok(json) = serde_json::to_string(msg) {
                            let mut s = sender_clone.lock().await;
                            if s.send(Message::Text(json.into())).await.is_err() {
                                return;
                            }
                        }

                        if kicked {
                            *binding_clone.lock().await = None;
                            event_rx = None;
                        }
                    }
                }
                Step::Event(Err(broadcast::error::RecvError::Lagged(_))) => {}
                Step::Event(Err(broadcast::error::RecvError::Closed)) => {
                    // Room ended, wait for a potential new binding
                    *binding_clone.lock().await = None;
                    event_rx = None;
                }
            }
        }
    });

    let mut admin_authed = false;
    let mut admin_task: Option<tokio::task::JoinHandle<()>> = None;

    // Process incoming messages
    while let Some(Ok(msg)) = receiver.next().await {
        let Message::Text(text) = msg else { continue };

        let client_msg: ClientMsg = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("Invalid message: {}", e);
                continue;
            }
        };

        match client_msg {
            // ─── Host ─────────────────────────────────────────────
            ClientMsg::HostCreate {
                quiz,
                mode,
                scoring,
                team_count,
            } => {
                if let Err(message) = validate_quiz(&quiz) {
                    send_msg(&sender, &ServerMsg::Error { message }).await;
                    continue;
                }
                let handle = game::create_room(
                    state.registry.clone(),
                    socket_id.clone(),
                    quiz,
                    RoomSettings {
                        mode,
                        scoring: scoring.unwrap_or(state.config.scoring),
                        shuffle_answers: state.config.shuffle_answers,
                        team_count: team_count.unwrap_or(2),
                        reap_ttl: state.config.room_ttl,
                    },
                );
                bind_room(&binding, &sub_tx, Binding::Quiz(handle.clone())).await;
                send_msg(
                    &sender,
                    &ServerMsg::HostCreated {
                        code: handle.code,
                    },
                )
                .await;
            }

            ClientMsg::HostStart { code } => {
                send_room_cmd(&state, &code, RoomCommand::Start {
                    socket_id: socket_id.clone(),
                })
                .await;
            }
            ClientMsg::HostShowResults { code } => {
                send_room_cmd(&state, &code, RoomCommand::ShowResults {
                    socket_id: socket_id.clone(),
                })
                .await;
            }
            ClientMsg::HostNext { code } => {
                send_room_cmd(&state, &code, RoomCommand::Next {
                    socket_id: socket_id.clone(),
                })
                .await;
            }
            ClientMsg::HostSkipQuestion { code } => {
                send_room_cmd(&state, &code, RoomCommand::Skip {
                    socket_id: socket_id.clone(),
                })
                .await;
            }
            ClientMsg::HostPause { code } => {
                send_room_cmd(&state, &code, RoomCommand::Pause {
                    socket_id: socket_id.clone(),
                })
                .await;
            }
            ClientMsg::HostResume { code } => {
                send_room_cmd(&state, &code, RoomCommand::Resume {
                    socket_id: socket_id.clone(),
                })
                .await;
            }
            ClientMsg::HostRenamePlayer {
                code,
                player_id,
                name,
            } => {
                send_room_cmd(&state, &code, RoomCommand::RenamePlayer {
                    socket_id: socket_id.clone(),
                    player_id,
                    name,
                })
                .await;
            }
            ClientMsg::HostKickPlayer { code, player_id } => {
                send_room_cmd(&state, &code, RoomCommand::KickPlayer {
                    socket_id: socket_id.clone(),
                    player_id,
                })
                .await;
            }
            ClientMsg::HostEndGame { code } => {
                send_room_cmd(&state, &code, RoomCommand::End {
                    socket_id: socket_id.clone(),
                })
                .await;
            }
            ClientMsg::HostSyncDisplay { code } => {
                send_room_cmd(&state, &code, RoomCommand::SyncDisplay {
                    socket_id: socket_id.clone(),
                })
                .await;
            }

            // ─── Player ───────────────────────────────────────────
            ClientMsg::PlayerJoin { code, name, team } => {
                let Some(handle) = state.registry.rooms.get(&code).map(|h| h.value().clone())
                else {
                    send_msg(
                        &sender,
                        &ServerMsg::Error {
                            message: "Room not found".to_string(),
                        },
                    )
                    .await;
                    continue;
                };
                bind_room(&binding, &sub_tx, Binding::Quiz(handle.clone())).await;
                let _ = handle
                    .cmd_tx
                    .send(RoomCommand::Join {
                        socket_id: socket_id.clone(),
                        client_id: client_id.clone(),
                        name,
                        team,
                    })
                    .await;
            }
            ClientMsg::PlayerAnswer {
                code,
                answer_index,
                time_left,
            } => {
                send_room_cmd(&state, &code, RoomCommand::Answer {
                    socket_id: socket_id.clone(),
                    answer_index,
                    time_left,
                })
                .await;
            }
            ClientMsg::PlayerReaction { code, emoji } => {
                send_room_cmd(&state, &code, RoomCommand::Reaction {
                    socket_id: socket_id.clone(),
                    emoji,
                })
                .await;
            }

            // ─── Display ──────────────────────────────────────────
            ClientMsg::DisplayJoin { code } => {
                let Some(handle) = state.registry.rooms.get(&code).map(|h| h.value().clone())
                else {
                    send_msg(
                        &sender,
                        &ServerMsg::DisplayError {
                            message: "Room not found".to_string(),
                        },
                    )
                    .await;
                    continue;
                };
                bind_room(&binding, &sub_tx, Binding::Quiz(handle.clone())).await;
                let _ = handle
                    .cmd_tx
                    .send(RoomCommand::DisplayJoin {
                        socket_id: socket_id.clone(),
                    })
                    .await;
            }

            // ─── Line-drawing game ────────────────────────────────
            ClientMsg::DotsCreate {
                questions,
                grid_size,
            } => {
                if questions.is_empty() {
                    send_msg(
                        &sender,
                        &ServerMsg::Error {
                            message: "At least one question required".to_string(),
                        },
                    )
                    .await;
                    continue;
                }
                if let Some(message) = questions.iter().find_map(|q| validate_question(q).err()) {
                    send_msg(&sender, &ServerMsg::Error { message }).await;
                    continue;
                }
                let grid_size = grid_size.clamp(dots::MIN_GRID, dots::MAX_GRID);
                let handle = dots::create_dots_room(
                    state.registry.clone(),
                    socket_id.clone(),
                    questions,
                    grid_size,
                    state.config.room_ttl,
                );
                bind_room(&binding, &sub_tx, Binding::Dots(handle.clone())).await;
                send_msg(
                    &sender,
                    &ServerMsg::DotsCreated {
                        code: handle.code,
                        grid_size,
                        teams: dots_palette(),
                    },
                )
                .await;
            }
            ClientMsg::DotsJoin { code, name, team } => {
                let Some(handle) = state.registry.dots_rooms.get(&code).map(|h| h.value().clone())
                else {
                    send_msg(
                        &sender,
                        &ServerMsg::Error {
                            message: "Room not found".to_string(),
                        },
                    )
                    .await;
                    continue;
                };
                bind_room(&binding, &sub_tx, Binding::Dots(handle.clone())).await;
                let _ = handle
                    .cmd_tx
                    .send(DotsCommand::Join {
                        socket_id: socket_id.clone(),
                        name,
                        team,
                    })
                    .await;
            }
            ClientMsg::DotsStart { code } => {
                send_dots_cmd(&state, &code, DotsCommand::Start {
                    socket_id: socket_id.clone(),
                })
                .await;
            }
            ClientMsg::DotsAnswer { code, answer_index } => {
                send_dots_cmd(&state, &code, DotsCommand::Answer {
                    socket_id: socket_id.clone(),
                    answer_index,
                })
                .await;
            }
            ClientMsg::DotsShowResults { code } => {
                send_dots_cmd(&state, &code, DotsCommand::ShowResults {
                    socket_id: socket_id.clone(),
                })
                .await;
            }
            ClientMsg::DotsSkip { code } => {
                send_dots_cmd(&state, &code, DotsCommand::Skip {
                    socket_id: socket_id.clone(),
                })
                .await;
            }
            ClientMsg::DotsNext { code } => {
                send_dots_cmd(&state, &code, DotsCommand::Next {
                    socket_id: socket_id.clone(),
                })
                .await;
            }
            ClientMsg::DotsDrawLine { code, line } => {
                send_dots_cmd(&state, &code, DotsCommand::DrawLine {
                    socket_id: socket_id.clone(),
                    line,
                })
                .await;
            }
            ClientMsg::DotsKick { code, player_id } => {
                send_dots_cmd(&state, &code, DotsCommand::Kick {
                    socket_id: socket_id.clone(),
                    player_id,
                })
                .await;
            }

            // ─── Admin ────────────────────────────────────────────
            ClientMsg::AdminSubscribe { password } => {
                let ok = state
                    .config
                    .admin_password
                    .as_deref()
                    .is_some_and(|expected| expected == password);
                if !ok {
                    send_msg(
                        &sender,
                        &ServerMsg::AdminError {
                            message: "Invalid password".to_string(),
                        },
                    )
                    .await;
                    continue;
                }
                admin_authed = true;
                send_msg(
                    &sender,
                    &ServerMsg::AdminRooms {
                        rooms: state.registry.room_listing(),
                    },
                )
                .await;
                if admin_task.is_none() {
                    let mut admin_rx = state.registry.admin_tx.subscribe();
                    let sender = sender.clone();
                    admin_task = Some(tokio::spawn(async move {
                        loop {
                            match admin_rx.recv().await {
                                Ok(msg) => {
                                    if let Ok(json) = serde_json::to_string(&msg) {
                                        let mut s = sender.lock().await;
                                        if s.send(Message::Text(json.into())).await.is_err() {
                                            return;
                                        }
                                    }
                                }
                                Err(
                                    tokio::sync::broadcast::error::RecvError::Lagged(_),
                                ) => continue,
                                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                                    return;
                                }
                            }
                        }
                    }));
                }
            }
            ClientMsg::AdminGetRooms => {
                if admin_authed {
                    send_msg(
                        &sender,
                        &ServerMsg::AdminRooms {
                            rooms: state.registry.room_listing(),
                        },
                    )
                    .await;
                }
            }
            ClientMsg::AdminKickPlayer { code, player_id } => {
                if admin_authed {
                    let quiz = state.registry.rooms.get(&code).map(|h| h.value().clone());
                    let dots = state.registry.dots_rooms.get(&code).map(|h| h.value().clone());
                    if let Some(handle) = quiz {
                        let _ = handle
                            .cmd_tx
                            .send(RoomCommand::AdminKickPlayer { player_id })
                            .await;
                    } else if let Some(handle) = dots {
                        let _ = handle
                            .cmd_tx
                            .send(DotsCommand::AdminKickPlayer { player_id })
                            .await;
                    }
                }
            }
            ClientMsg::AdminCloseRoom { code } => {
                if admin_authed {
                    let quiz = state.registry.rooms.get(&code).map(|h| h.value().clone());
                    let dots = state.registry.dots_rooms.get(&code).map(|h| h.value().clone());
                    if let Some(handle) = quiz {
                        let _ = handle.cmd_tx.send(RoomCommand::Close).await;
                    } else if let Some(handle) = dots {
                        let _ = handle.cmd_tx.send(DotsCommand::Close).await;
                    }
                }
            }
        }
    }

    // Socket disconnected
    tracing::info!("WebSocket disconnected: {}", socket_id);
    event_task.abort();
    if let Some(task) = admin_task {
        task.abort();
    }

    // Notify the bound room about the disconnect
    let bound = binding.lock().await.clone();
    if let Some(bound) = bound {
        bound.send_disconnect(&socket_id).await;
    }
}

/// Subscribe to the room, record the binding, then hand the ready receiver
/// to the forwarding task. Callers must do this before sending the room any
/// command that triggers a reply.
async fn bind_room(
    binding: &Mutex<Option<Binding>>,
    sub_tx: &mpsc::UnboundedSender<broadcast::Receiver<RoomEvent>>,
    new: Binding,
) {
    let rx = new.event_tx().subscribe();
    *binding.lock().await = Some(new);
    let _ = sub_tx.send(rx);
}

// The map guard must not be held across the send: a full command channel
// would park this task holding the shard lock the room's removal needs.
async fn send_room_cmd(state: &AppState, code: &str, cmd: RoomCommand) {
    let handle = state.registry.rooms.get(code).map(|h| h.value().clone());
    if let Some(handle) = handle {
        let _ = handle.cmd_tx.send(cmd).await;
    }
}

async fn send_dots_cmd(state: &AppState, code: &str, cmd: DotsCommand) {
    let handle = state.registry.dots_rooms.get(code).map(|h| h.value().clone());
    if let Some(handle) = handle {
        let _ = handle.cmd_tx.send(cmd).await;
    }
}

async fn send_msg(sender: &Arc<Mutex<SplitSink<WebSocket, Message>>>, msg: &ServerMsg) {
    if let Ok(json) = serde_json::to_string(msg) {
        let mut s = sender.lock().await;
        let _ = s.send(Message::Text(json.into())).await;
    }
}

fn dots_palette() -> Vec<Team> {
    game::TEAM_PALETTE
        .iter()
        .take(2)
        .map(|(name, color, emoji)| Team {
            name: name.to_string(),
            color: color.to_string(),
            emoji: emoji.to_string(),
        })
        .collect()
}

pub fn validate_quiz(quiz: &Quiz) -> Result<(), String> {
    if quiz.title.trim().is_empty() {
        return Err("Quiz needs a title".to_string());
    }
    if quiz.questions.is_empty() {
        return Err("Quiz needs at least one question".to_string());
    }
    if quiz.questions.len() > 100 {
        return Err("Too many questions".to_string());
    }
    for question in &quiz.questions {
        validate_question(question)?;
    }
    Ok(())
}

pub fn validate_question(question: &Question) -> Result<(), String> {
    if question.question.trim().is_empty() {
        return Err("Question text cannot be empty".to_string());
    }
    if !(2..=4).contains(&question.answers.len()) {
        return Err("Questions need 2-4 answers".to_string());
    }
    if question.answers.iter().any(|a| a.trim().is_empty()) {
        return Err("Answers cannot be empty".to_string());
    }
    if question.correct >= question.answers.len() {
        return Err("Correct answer index out of range".to_string());
    }
    if !(5..=120).contains(&question.time) {
        return Err("Question time must be 5-120 seconds".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config() -> Arc<ServerConfig> {
        Arc::new(ServerConfig {
            port: 0,
            admin_password: None,
            shuffle_answers: true,
            scoring: ScoringVariant::TimeDecay,
            room_ttl: Duration::from_secs(600),
            static_dir: "public".into(),
            ai: None,
        })
    }

    #[tokio::test]
    async fn pending_room_command_does_not_block_registry_removal() {
        let registry = Registry::new();
        let (cmd_tx, mut cmd_rx) = mpsc::channel(1);
        let (event_tx, _) = broadcast::channel(8);
        registry.rooms.insert(
            "111111".into(),
            RoomHandle {
                code: "111111".into(),
                cmd_tx: cmd_tx.clone(),
                event_tx,
            },
        );
        // Fill the command channel so the next send parks
        cmd_tx.try_send(RoomCommand::ReapCheck).unwrap();

        let state = AppState {
            registry: registry.clone(),
            config: test_config(),
            generator: None,
        };
        let parked = tokio::spawn(async move {
            send_room_cmd(&state, "111111", RoomCommand::Close).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Removal takes the shard write lock; it must not wait on the
        // parked send.
        registry.remove_room("111111");
        assert!(!registry.rooms.contains_key("111111"));

        let _ = cmd_rx.recv().await;
        parked.await.unwrap();
    }

    fn quiz() -> Quiz {
        Quiz {
            title: "T".into(),
            questions: vec![Question {
                question: "q".into(),
                answers: vec!["a".into(), "b".into()],
                correct: 0,
                time: 10,
                image: None,
                double_points: false,
            }],
        }
    }

    #[test]
    fn valid_quiz_passes() {
        assert!(validate_quiz(&quiz()).is_ok());
    }

    #[test]
    fn quiz_needs_title_and_questions() {
        let mut q = quiz();
        q.title = "  ".into();
        assert!(validate_quiz(&q).is_err());

        let mut q = quiz();
        q.questions.clear();
        assert!(validate_quiz(&q).is_err());
    }

    #[test]
    fn question_bounds_are_enforced() {
        let mut q = quiz();
        q.questions[0].correct = 2;
        assert!(validate_quiz(&q).is_err());

        let mut q = quiz();
        q.questions[0].answers = vec!["a".into()];
        assert!(validate_quiz(&q).is_err());

        let mut q = quiz();
        q.questions[0].answers = (0..5).map(|i| i.to_string()).collect();
        assert!(validate_quiz(&q).is_err());

        let mut q = quiz();
        q.questions[0].time = 3;
        assert!(validate_quiz(&q).is_err());
    }
}
