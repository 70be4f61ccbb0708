use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::registry::{Registry, RoomEvent, RoomHandle};
use crate::scoring::{self, SyncWatch};
use crate::shuffle::AnswerOrder;
use crate::types::*;

/// Fixed palette teams are assigned from at room creation.
pub const TEAM_PALETTE: [(&str, &str, &str); 8] = [
    ("Red", "#e63946", "🔥"),
    ("Blue", "#457b9d", "🌊"),
    ("Green", "#2a9d8f", "🌿"),
    ("Yellow", "#e9c46a", "⚡"),
    ("Purple", "#7b2d8b", "🔮"),
    ("Orange", "#f4a261", "🦊"),
    ("Pink", "#ff70a6", "🌸"),
    ("Teal", "#0fa3b1", "🐬"),
];

/// Commands the WebSocket layer sends to a quiz room task. All mutations
/// of a room go through this channel, one command at a time.
#[derive(Debug, Clone)]
pub enum RoomCommand {
    Join {
        socket_id: String,
        client_id: String,
        name: String,
        team: Option<String>,
    },
    Answer {
        socket_id: String,
        answer_index: usize,
        time_left: f64,
    },
    Reaction {
        socket_id: String,
        emoji: String,
    },
    Start {
        socket_id: String,
    },
    ShowResults {
        socket_id: String,
    },
    Next {
        socket_id: String,
    },
    Skip {
        socket_id: String,
    },
    Pause {
        socket_id: String,
    },
    Resume {
        socket_id: String,
    },
    End {
        socket_id: String,
    },
    RenamePlayer {
        socket_id: String,
        player_id: String,
        name: String,
    },
    KickPlayer {
        socket_id: String,
        player_id: String,
    },
    DisplayJoin {
        socket_id: String,
    },
    SyncDisplay {
        socket_id: String,
    },
    AdminKickPlayer {
        player_id: String,
    },
    Close,
    Disconnect {
        socket_id: String,
    },
    ReapCheck,
}

/// A player in a quiz room. `id` is the stable scoring key; `socket_id`
/// is only a routing address, rebound on reconnect.
#[derive(Debug, Clone)]
pub struct Player {
    pub id: String,
    pub client_id: String,
    pub socket_id: String,
    pub connected: bool,
    pub name: String,
    pub team: Option<String>,
    pub score: u32,
    pub streak: u32,
    pub max_streak: u32,
    pub answers: HashMap<usize, AnswerRecord>,
    pub eliminated: bool,
    /// Answer ordering for the current question only.
    pub order: Option<AnswerOrder>,
}

impl Player {
    fn info(&self) -> PlayerInfo {
        PlayerInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            team: self.team.clone(),
            score: self.score,
            streak: self.streak,
            eliminated: self.eliminated,
            connected: self.connected,
        }
    }
}

/// The internal state of a quiz room.
pub struct RoomState {
    pub code: String,
    pub host_socket_id: String,
    pub host_connected: bool,
    pub quiz: Quiz,
    pub mode: GameMode,
    pub scoring: ScoringVariant,
    pub shuffle_answers: bool,
    pub teams: Vec<Team>,
    pub phase: RoomPhase,
    /// None before the first question.
    pub current: Option<usize>,
    pub question_start: Option<Instant>,
    pub paused: bool,
    pub players: Vec<Player>,
    pub display_sockets: Vec<String>,
    pub sync_watch: SyncWatch,
    /// Player ids in answer-arrival order for the current question.
    pub arrival_order: Vec<String>,
    pub reap_ttl: Duration,
}

impl RoomState {
    fn broadcast(&self, tx: &broadcast::Sender<RoomEvent>, msg: ServerMsg) {
        let _ = tx.send(RoomEvent::Broadcast { msg });
    }

    fn send_to(&self, tx: &broadcast::Sender<RoomEvent>, socket_id: &str, msg: ServerMsg) {
        let _ = tx.send(RoomEvent::SendTo {
            socket_id: socket_id.to_string(),
            msg,
        });
    }

    fn send_host(&self, tx: &broadcast::Sender<RoomEvent>, msg: ServerMsg) {
        self.send_to(tx, &self.host_socket_id.clone(), msg);
    }

    fn send_displays(&self, tx: &broadcast::Sender<RoomEvent>, msg: ServerMsg) {
        for socket in &self.display_sockets {
            self.send_to(tx, socket, msg.clone());
        }
    }

    fn is_host(&self, socket_id: &str) -> bool {
        socket_id == self.host_socket_id
    }

    fn progress(&self) -> QuestionProgress {
        QuestionProgress {
            current: self.current.map(|i| i + 1).unwrap_or(0),
            total: self.quiz.questions.len(),
        }
    }

    fn current_question(&self) -> Option<&Question> {
        self.current.and_then(|i| self.quiz.questions.get(i))
    }

    fn public_question(&self, q: &Question) -> PublicQuestion {
        PublicQuestion {
            question: q.question.clone(),
            answers: q.answers.clone(),
            time: q.time,
            image: q.image.clone(),
            double_points: q.double_points,
        }
    }

    fn player_list(&self) -> Vec<PlayerInfo> {
        self.players.iter().map(|p| p.info()).collect()
    }

    fn answered_count(&self) -> usize {
        let Some(i) = self.current else { return 0 };
        self.players
            .iter()
            .filter(|p| p.answers.contains_key(&i))
            .count()
    }

    /// Ranked leaderboard; `top` of 0 means everyone.
    fn leaderboard(&self, top: usize) -> Vec<LeaderboardEntry> {
        let mut ranked: Vec<&Player> = self.players.iter().collect();
        ranked.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.name.cmp(&b.name)));
        let take = if top == 0 { ranked.len() } else { top };
        ranked
            .into_iter()
            .take(take)
            .enumerate()
            .map(|(i, p)| LeaderboardEntry {
                rank: i + 1,
                name: p.name.clone(),
                score: p.score,
                team: p.team.clone(),
            })
            .collect()
    }

    fn team_totals(&self) -> Vec<TeamTotal> {
        self.teams
            .iter()
            .map(|team| TeamTotal {
                team: team.name.clone(),
                color: team.color.clone(),
                emoji: team.emoji.clone(),
                score: self
                    .players
                    .iter()
                    .filter(|p| p.team.as_deref() == Some(team.name.as_str()))
                    .map(|p| p.score)
                    .sum(),
            })
            .collect()
    }

    fn summary(&self) -> RoomSummary {
        RoomSummary {
            code: self.code.clone(),
            kind: RoomKind::Quiz,
            title: self.quiz.title.clone(),
            state: serde_json::to_value(self.phase)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default(),
            mode: Some(self.mode),
            player_count: self.players.len(),
            players: self.players.iter().map(|p| p.name.clone()).collect(),
            progress: self.progress(),
        }
    }

    fn publish(&self, registry: &Registry) {
        registry.publish_summary(self.summary());
    }
}

fn palette_teams(count: usize) -> Vec<Team> {
    TEAM_PALETTE
        .iter()
        .take(count.clamp(2, TEAM_PALETTE.len()))
        .map(|(name, color, emoji)| Team {
            name: name.to_string(),
            color: color.to_string(),
            emoji: emoji.to_string(),
        })
        .collect()
}

/// Settings a quiz room is created with.
pub struct RoomSettings {
    pub mode: GameMode,
    pub scoring: ScoringVariant,
    pub shuffle_answers: bool,
    pub team_count: usize,
    pub reap_ttl: Duration,
}

/// Create a quiz room and spawn its task. Returns the handle.
pub fn create_room(
    registry: Arc<Registry>,
    host_socket_id: String,
    quiz: Quiz,
    settings: RoomSettings,
) -> RoomHandle {
    let code = registry.allocate_code();

    let (cmd_tx, cmd_rx) = mpsc::channel(256);
    let (event_tx, _) = broadcast::channel(256);

    let handle = RoomHandle {
        code: code.clone(),
        cmd_tx: cmd_tx.clone(),
        event_tx: event_tx.clone(),
    };
    registry.rooms.insert(code.clone(), handle.clone());

    let teams = if settings.mode == GameMode::Team {
        palette_teams(settings.team_count)
    } else {
        Vec::new()
    };

    let state = RoomState {
        code: code.clone(),
        host_socket_id,
        host_connected: true,
        quiz,
        mode: settings.mode,
        scoring: settings.scoring,
        shuffle_answers: settings.shuffle_answers,
        teams,
        phase: RoomPhase::Lobby,
        current: None,
        question_start: None,
        paused: false,
        players: Vec::new(),
        display_sockets: Vec::new(),
        sync_watch: SyncWatch::default(),
        arrival_order: Vec::new(),
        reap_ttl: settings.reap_ttl,
    };
    state.publish(&registry);

    tokio::spawn(room_task(state, cmd_rx, cmd_tx, event_tx, registry));
    tracing::info!("Room created: {}", code);

    handle
}

async fn room_task(
    mut state: RoomState,
    mut cmd_rx: mpsc::Receiver<RoomCommand>,
    cmd_tx: mpsc::Sender<RoomCommand>,
    event_tx: broadcast::Sender<RoomEvent>,
    registry: Arc<Registry>,
) {
    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            RoomCommand::Join {
                socket_id,
                client_id,
                name,
                team,
            } => {
                handle_join(&mut state, &event_tx, &registry, socket_id, client_id, name, team);
            }
            RoomCommand::Answer {
                socket_id,
                answer_index,
                time_left,
            } => {
                handle_answer(&mut state, &event_tx, socket_id, answer_index, time_left);
            }
            RoomCommand::Reaction { socket_id, emoji } => {
                handle_reaction(&mut state, &event_tx, socket_id, emoji);
            }
            RoomCommand::Start { socket_id } => {
                if state.is_host(&socket_id) && state.phase == RoomPhase::Lobby {
                    advance_question(&mut state, &event_tx, &registry, &cmd_tx);
                }
            }
            RoomCommand::ShowResults { socket_id } => {
                if state.is_host(&socket_id) {
                    handle_show_results(&mut state, &event_tx, &registry);
                }
            }
            RoomCommand::Next { socket_id } => {
                if state.is_host(&socket_id) && state.phase == RoomPhase::Leaderboard {
                    advance_question(&mut state, &event_tx, &registry, &cmd_tx);
                }
            }
            RoomCommand::Skip { socket_id } => {
                // Abandons the running question without results
                if state.is_host(&socket_id) && state.phase == RoomPhase::Question {
                    advance_question(&mut state, &event_tx, &registry, &cmd_tx);
                }
            }
            RoomCommand::Pause { socket_id } => {
                if state.is_host(&socket_id) && state.phase == RoomPhase::Question && !state.paused
                {
                    state.paused = true;
                    state.broadcast(&event_tx, ServerMsg::GamePaused);
                }
            }
            RoomCommand::Resume { socket_id } => {
                if state.is_host(&socket_id) && state.paused {
                    state.paused = false;
                    state.broadcast(&event_tx, ServerMsg::GameResumed);
                }
            }
            RoomCommand::End { socket_id } => {
                if state.is_host(&socket_id) && state.phase != RoomPhase::Finished {
                    finish_game(&mut state, &event_tx, &registry, &cmd_tx);
                }
            }
            RoomCommand::RenamePlayer {
                socket_id,
                player_id,
                name,
            } => {
                if state.is_host(&socket_id) {
                    handle_rename(&mut state, &event_tx, &registry, player_id, name);
                }
            }
            RoomCommand::KickPlayer {
                socket_id,
                player_id,
            } => {
                if state.is_host(&socket_id) {
                    handle_kick(&mut state, &event_tx, &registry, player_id);
                }
            }
            RoomCommand::AdminKickPlayer { player_id } => {
                handle_kick(&mut state, &event_tx, &registry, player_id);
            }
            RoomCommand::DisplayJoin { socket_id } => {
                handle_display_join(&mut state, &event_tx, socket_id);
            }
            RoomCommand::SyncDisplay { socket_id } => {
                if state.is_host(&socket_id) {
                    let msg = display_snapshot(&state);
                    state.send_displays(&event_tx, msg);
                }
            }
            RoomCommand::Disconnect { socket_id } => {
                handle_disconnect(&mut state, &event_tx, &registry, socket_id);
            }
            RoomCommand::Close => {
                state.broadcast(
                    &event_tx,
                    ServerMsg::Error {
                        message: "Room closed".to_string(),
                    },
                );
                registry.remove_room(&state.code);
                break;
            }
            RoomCommand::ReapCheck => {
                if state.phase == RoomPhase::Finished {
                    registry.remove_room(&state.code);
                    break;
                }
            }
        }
    }

    registry.remove_room(&state.code);
    tracing::info!("Room {} task ended", state.code);
}

fn handle_join(
    state: &mut RoomState,
    tx: &broadcast::Sender<RoomEvent>,
    registry: &Registry,
    socket_id: String,
    client_id: String,
    name: String,
    team: Option<String>,
) {
    // A known client token rebinds its player to the new socket, any phase,
    // but only while the token's previous socket is gone.
    if !client_id.is_empty() {
        if let Some(pos) = state.players.iter().position(|p| p.client_id == client_id) {
            if state.players[pos].connected {
                state.send_to(
                    tx,
                    &socket_id,
                    ServerMsg::Error {
                        message: "Already connected".to_string(),
                    },
                );
                return;
            }
            let player = &mut state.players[pos];
            player.socket_id = socket_id.clone();
            player.connected = true;
            let msg = ServerMsg::PlayerRejoined {
                player_id: player.id.clone(),
                name: player.name.clone(),
                score: player.score,
                streak: player.streak,
                phase: state.phase,
                progress: state.progress(),
            };
            state.send_to(tx, &socket_id, msg);
            let list = state.player_list();
            state.send_host(tx, ServerMsg::HostPlayerList { players: list });
            state.publish(registry);
            tracing::info!("Player reconnected to room {}", state.code);
            return;
        }
    }

    if state.phase != RoomPhase::Lobby {
        state.send_to(
            tx,
            &socket_id,
            ServerMsg::Error {
                message: "Game already started".to_string(),
            },
        );
        return;
    }

    let name = name.trim().to_string();
    if name.is_empty() || name.chars().count() > 20 {
        state.send_to(
            tx,
            &socket_id,
            ServerMsg::Error {
                message: "Name must be 1-20 characters".to_string(),
            },
        );
        return;
    }
    if state
        .players
        .iter()
        .any(|p| p.name.eq_ignore_ascii_case(&name))
    {
        state.send_to(
            tx,
            &socket_id,
            ServerMsg::Error {
                message: "Name already taken".to_string(),
            },
        );
        return;
    }

    let team = if state.mode == GameMode::Team {
        let Some(pick) = team
            .as_deref()
            .and_then(|t| state.teams.iter().find(|slot| slot.name == t))
        else {
            state.send_to(
                tx,
                &socket_id,
                ServerMsg::Error {
                    message: "Pick a team".to_string(),
                },
            );
            return;
        };
        Some(pick.name.clone())
    } else {
        None
    };

    let player = Player {
        id: Uuid::new_v4().to_string(),
        client_id,
        socket_id: socket_id.clone(),
        connected: true,
        name: name.clone(),
        team: team.clone(),
        score: 0,
        streak: 0,
        max_streak: 0,
        answers: HashMap::new(),
        eliminated: false,
        order: None,
    };
    let player_id = player.id.clone();
    state.players.push(player);

    state.send_to(
        tx,
        &socket_id,
        ServerMsg::PlayerJoined {
            player_id,
            code: state.code.clone(),
            name,
            team,
        },
    );
    let list = state.player_list();
    state.send_host(tx, ServerMsg::HostPlayerList { players: list });
    state.publish(registry);
}

fn handle_answer(
    state: &mut RoomState,
    tx: &broadcast::Sender<RoomEvent>,
    socket_id: String,
    answer_index: usize,
    time_left: f64,
) {
    // Validation failures are silent: a cheater gets no oracle.
    if state.phase != RoomPhase::Question {
        return;
    }
    let Some(index) = state.current else { return };
    let question = state.quiz.questions[index].clone();
    let Some(start) = state.question_start else {
        return;
    };
    let elapsed_ms = start.elapsed().as_millis() as u64;

    let Some(pos) = state
        .players
        .iter()
        .position(|p| p.socket_id == socket_id)
    else {
        return;
    };
    if state.players[pos].eliminated {
        return;
    }
    // Answers are write-once per question
    if state.players[pos].answers.contains_key(&index) {
        return;
    }
    if elapsed_ms < scoring::MIN_ANSWER_MS {
        tracing::debug!(
            "Room {}: implausibly fast answer ({} ms) rejected",
            state.code,
            elapsed_ms
        );
        return;
    }

    let canonical = {
        let player = &state.players[pos];
        match &player.order {
            Some(order) => match order.canonical(answer_index) {
                Some(c) => c,
                None => return,
            },
            None => answer_index,
        }
    };
    if canonical >= question.answers.len() {
        return;
    }

    let correct = canonical == question.correct;
    let survivor = state.mode == GameMode::Survivor;
    let scoring_variant = state.scoring;

    let player = &mut state.players[pos];
    if correct {
        player.streak += 1;
        player.max_streak = player.max_streak.max(player.streak);
    } else {
        player.streak = 0;
    }
    let time_left = scoring::clamp_time_left(time_left, question.time);
    let points = scoring::score_answer(scoring_variant, correct, time_left, &question, player.streak);

    player.answers.insert(
        index,
        AnswerRecord {
            answer_index: canonical,
            correct,
            elapsed_ms,
            base_points: points.base,
            speed_bonus: 0,
            streak_bonus: points.streak_bonus,
        },
    );
    player.score += points.total();
    if survivor && !correct {
        player.eliminated = true;
    }

    let ack = ServerMsg::PlayerAnswerResult {
        correct,
        points: points.total(),
        score: player.score,
        streak: player.streak,
    };
    let eliminated_now = survivor && !correct;
    let player_id = player.id.clone();
    let player_name = player.name.clone();

    state.arrival_order.push(player_id);
    state.send_to(tx, &socket_id, ack);
    if eliminated_now {
        state.send_to(tx, &socket_id, ServerMsg::PlayerEliminated);
    }

    let count = state.answered_count();
    let total = state.players.len();
    state.send_host(tx, ServerMsg::HostAnsweredCount { count, total });
    state.broadcast(tx, ServerMsg::PlayerAnswered { count, total });

    if let Some(hits) = state.sync_watch.record(&player_name, elapsed_ms, correct) {
        let correct_count = hits.iter().filter(|(_, ok)| *ok).count();
        let names = hits.into_iter().map(|(n, _)| n).collect();
        state.send_host(
            tx,
            ServerMsg::HostSuspiciousActivity {
                names,
                correct_count,
                window_ms: scoring::SYNC_WINDOW_MS,
            },
        );
    }
}

/// Move to the next question, or finish when past the end. Dispatches
/// per-player payloads so each player can get their own answer order.
fn advance_question(
    state: &mut RoomState,
    tx: &broadcast::Sender<RoomEvent>,
    registry: &Registry,
    cmd_tx: &mpsc::Sender<RoomCommand>,
) {
    let next = state.current.map(|i| i + 1).unwrap_or(0);
    if next >= state.quiz.questions.len() {
        finish_game(state, tx, registry, cmd_tx);
        return;
    }

    state.current = Some(next);
    state.phase = RoomPhase::Question;
    state.question_start = Some(Instant::now());
    state.paused = false;
    state.sync_watch.reset();
    state.arrival_order.clear();

    let question = state.quiz.questions[next].clone();
    let total = state.quiz.questions.len();

    // Hosts are trusted with the correct index
    state.send_host(
        tx,
        ServerMsg::HostQuestion {
            index: next,
            total,
            question: question.clone(),
        },
    );

    let mut rng = rand::rng();
    let mut sends = Vec::with_capacity(state.players.len());
    for player in &mut state.players {
        let order = if state.shuffle_answers {
            AnswerOrder::random(question.answers.len(), &mut rng)
        } else {
            AnswerOrder::identity(question.answers.len())
        };
        let answers = order.presented(&question.answers);
        player.order = Some(order);
        sends.push((
            player.socket_id.clone(),
            ServerMsg::GameQuestion {
                index: next,
                total,
                question: PublicQuestion {
                    question: question.question.clone(),
                    answers,
                    time: question.time,
                    image: question.image.clone(),
                    double_points: question.double_points,
                },
            },
        ));
    }
    for (socket, msg) in sends {
        state.send_to(tx, &socket, msg);
    }
    let snapshot = display_snapshot(state);
    state.send_displays(tx, snapshot);
    state.publish(registry);
}

fn handle_show_results(
    state: &mut RoomState,
    tx: &broadcast::Sender<RoomEvent>,
    registry: &Registry,
) {
    // Only legal while a question is open
    if state.phase != RoomPhase::Question {
        return;
    }
    let Some(index) = state.current else { return };
    let question = state.quiz.questions[index].clone();

    // Speed bonus needs the full answer set, so it settles here, not at
    // answer time. Time-decay rooms already priced speed into the base.
    if state.scoring == ScoringVariant::FlatBonus {
        // Kicked players may be gone from the roster, so keep ids aligned
        // with the records the ranking indexes into.
        let entries: Vec<(String, u64, bool)> = state
            .arrival_order
            .iter()
            .filter_map(|id| {
                let player = state.players.iter().find(|p| &p.id == id)?;
                let record = player.answers.get(&index)?;
                Some((id.clone(), record.elapsed_ms, record.correct))
            })
            .collect();
        let records: Vec<(u64, bool)> = entries.iter().map(|&(_, ms, ok)| (ms, ok)).collect();
        let bonus = scoring::speed_bonus_points(&question);
        for arrival_idx in scoring::speed_bonus_ranking(&records, scoring::SPEED_BONUS_RANKS) {
            let id = &entries[arrival_idx].0;
            if let Some(player) = state.players.iter_mut().find(|p| &p.id == id) {
                if let Some(record) = player.answers.get_mut(&index) {
                    record.speed_bonus = bonus;
                    player.score += bonus;
                }
            }
        }
    }

    state.phase = RoomPhase::Leaderboard;

    let mut counts = vec![0usize; question.answers.len()];
    for player in &state.players {
        if let Some(record) = player.answers.get(&index) {
            if let Some(slot) = counts.get_mut(record.answer_index) {
                *slot += 1;
            }
        }
    }

    let leaderboard = state.leaderboard(5);
    let is_last = index + 1 >= state.quiz.questions.len();

    // Correct index is revealed to everyone at this step
    state.broadcast(
        tx,
        ServerMsg::GameResults {
            correct: question.correct,
            counts: counts.clone(),
            leaderboard: leaderboard.clone(),
            is_last,
        },
    );
    state.send_host(
        tx,
        ServerMsg::HostResults {
            correct: question.correct,
            counts,
            leaderboard,
            is_last,
        },
    );
    state.publish(registry);
}

fn finish_game(
    state: &mut RoomState,
    tx: &broadcast::Sender<RoomEvent>,
    registry: &Registry,
    cmd_tx: &mpsc::Sender<RoomCommand>,
) {
    state.phase = RoomPhase::Finished;

    let final_standings = state.leaderboard(0);
    let team_totals = if state.mode == GameMode::Team {
        Some(state.team_totals())
    } else {
        None
    };

    state.broadcast(
        tx,
        ServerMsg::GameEnd {
            final_standings: final_standings.clone(),
            team_totals: team_totals.clone(),
        },
    );
    state.send_displays(
        tx,
        ServerMsg::DisplayEnd {
            final_standings,
            team_totals,
        },
    );
    state.publish(registry);

    // Idle reap: one-shot, re-checked by the task so an earlier explicit
    // close simply wins.
    let reap_tx = cmd_tx.clone();
    let ttl = state.reap_ttl;
    tokio::spawn(async move {
        tokio::time::sleep(ttl).await;
        let _ = reap_tx.send(RoomCommand::ReapCheck).await;
    });
}

fn handle_rename(
    state: &mut RoomState,
    tx: &broadcast::Sender<RoomEvent>,
    registry: &Registry,
    player_id: String,
    name: String,
) {
    let name = name.trim().to_string();
    if name.is_empty() || name.chars().count() > 20 {
        return;
    }
    if state
        .players
        .iter()
        .any(|p| p.id != player_id && p.name.eq_ignore_ascii_case(&name))
    {
        return;
    }
    let Some(player) = state.players.iter_mut().find(|p| p.id == player_id) else {
        return;
    };
    player.name = name.clone();
    let socket = player.socket_id.clone();
    state.send_to(tx, &socket, ServerMsg::PlayerRenamed { name });
    let list = state.player_list();
    state.send_host(tx, ServerMsg::HostPlayerList { players: list });
    state.publish(registry);
}

fn handle_kick(
    state: &mut RoomState,
    tx: &broadcast::Sender<RoomEvent>,
    registry: &Registry,
    player_id: String,
) {
    let Some(pos) = state.players.iter().position(|p| p.id == player_id) else {
        return;
    };
    let player = state.players.remove(pos);
    let _ = tx.send(RoomEvent::Kick {
        socket_id: player.socket_id,
        msg: ServerMsg::PlayerKicked {
            message: "You have been removed from the game".to_string(),
        },
    });
    let list = state.player_list();
    state.send_host(tx, ServerMsg::HostPlayerList { players: list });
    state.publish(registry);
}

fn handle_display_join(
    state: &mut RoomState,
    tx: &broadcast::Sender<RoomEvent>,
    socket_id: String,
) {
    if !state.display_sockets.contains(&socket_id) {
        state.display_sockets.push(socket_id.clone());
    }
    state.send_to(
        tx,
        &socket_id,
        ServerMsg::DisplayJoined {
            code: state.code.clone(),
            title: state.quiz.title.clone(),
        },
    );
}

fn display_snapshot(state: &RoomState) -> ServerMsg {
    let question = match state.phase {
        RoomPhase::Question => state.current_question().map(|q| state.public_question(q)),
        _ => None,
    };
    ServerMsg::DisplaySync {
        phase: state.phase,
        progress: state.progress(),
        question,
    }
}

fn handle_reaction(
    state: &mut RoomState,
    tx: &broadcast::Sender<RoomEvent>,
    socket_id: String,
    emoji: String,
) {
    let Some(player) = state.players.iter().find(|p| p.socket_id == socket_id) else {
        return;
    };
    if emoji.chars().count() > 8 {
        return;
    }
    // Everyone but the sender sees the reaction, displays included
    let _ = tx.send(RoomEvent::BroadcastExcept {
        exclude: socket_id,
        msg: ServerMsg::DisplayReaction {
            name: player.name.clone(),
            emoji,
        },
    });
}

fn handle_disconnect(
    state: &mut RoomState,
    tx: &broadcast::Sender<RoomEvent>,
    registry: &Registry,
    socket_id: String,
) {
    if state.is_host(&socket_id) {
        state.host_connected = false;
        return;
    }
    if let Some(pos) = state.display_sockets.iter().position(|s| s == &socket_id) {
        state.display_sockets.remove(pos);
        return;
    }
    let Some(pos) = state.players.iter().position(|p| p.socket_id == socket_id) else {
        return;
    };
    if state.phase == RoomPhase::Lobby {
        // Scores don't exist yet, drop the player entirely
        state.players.remove(pos);
    } else {
        state.players[pos].connected = false;
    }
    let list = state.player_list();
    state.send_host(tx, ServerMsg::HostPlayerList { players: list });
    state.publish(registry);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiz(questions: usize) -> Quiz {
        Quiz {
            title: "Test".into(),
            questions: (0..questions)
                .map(|i| Question {
                    question: format!("q{i}"),
                    answers: vec!["a".into(), "b".into(), "c".into(), "d".into()],
                    correct: 2,
                    time: 10,
                    image: None,
                    double_points: false,
                })
                .collect(),
        }
    }

    fn room(quiz: Quiz, mode: GameMode, scoring: ScoringVariant) -> RoomState {
        let teams = if mode == GameMode::Team {
            palette_teams(2)
        } else {
            Vec::new()
        };
        RoomState {
            code: "123456".into(),
            host_socket_id: "host".into(),
            host_connected: true,
            quiz,
            mode,
            scoring,
            shuffle_answers: false,
            teams,
            phase: RoomPhase::Lobby,
            current: None,
            question_start: None,
            paused: false,
            players: Vec::new(),
            display_sockets: Vec::new(),
            sync_watch: SyncWatch::default(),
            arrival_order: Vec::new(),
            reap_ttl: Duration::from_secs(600),
        }
    }

    fn channel() -> broadcast::Sender<RoomEvent> {
        broadcast::channel(256).0
    }

    fn join(state: &mut RoomState, tx: &broadcast::Sender<RoomEvent>, socket: &str, name: &str) {
        let registry = Registry::new();
        handle_join(
            state,
            tx,
            &registry,
            socket.into(),
            format!("client-{socket}"),
            name.into(),
            state.teams.first().map(|t| t.name.clone()),
        );
    }

    /// Open question 0 with a start instant far enough in the past to
    /// clear the plausibility floor.
    fn open_question(state: &mut RoomState, index: usize) {
        state.phase = RoomPhase::Question;
        state.current = Some(index);
        state.question_start = Some(Instant::now() - Duration::from_secs(3));
        state.sync_watch.reset();
        state.arrival_order.clear();
        for p in &mut state.players {
            p.order = Some(AnswerOrder::identity(
                state.quiz.questions[index].answers.len(),
            ));
        }
    }

    #[test]
    fn join_rejects_duplicate_names_case_insensitive() {
        let mut state = room(quiz(1), GameMode::Solo, ScoringVariant::TimeDecay);
        let tx = channel();
        join(&mut state, &tx, "s1", "Alice");
        join(&mut state, &tx, "s2", "ALICE");
        assert_eq!(state.players.len(), 1);
    }

    #[test]
    fn join_after_lobby_is_refused_but_rejoin_works() {
        let mut state = room(quiz(1), GameMode::Solo, ScoringVariant::TimeDecay);
        let tx = channel();
        join(&mut state, &tx, "s1", "Alice");
        open_question(&mut state, 0);

        // New client token: refused
        join(&mut state, &tx, "s2", "Bob");
        assert_eq!(state.players.len(), 1);

        // Known token on a fresh socket after a drop: rebound
        let registry = Registry::new();
        handle_disconnect(&mut state, &tx, &registry, "s1".into());
        assert!(!state.players[0].connected);
        handle_join(
            &mut state,
            &tx,
            &registry,
            "s3".into(),
            "client-s1".into(),
            "Alice".into(),
            None,
        );
        assert_eq!(state.players.len(), 1);
        assert_eq!(state.players[0].socket_id, "s3");
        assert!(state.players[0].connected);
    }

    #[test]
    fn rejoin_is_refused_while_the_token_is_live() {
        let mut state = room(quiz(1), GameMode::Solo, ScoringVariant::TimeDecay);
        let tx = channel();
        join(&mut state, &tx, "s1", "Alice");
        open_question(&mut state, 0);

        // Second tab with the same token must not steal the live socket
        let registry = Registry::new();
        handle_join(
            &mut state,
            &tx,
            &registry,
            "s2".into(),
            "client-s1".into(),
            "Alice".into(),
            None,
        );
        assert_eq!(state.players.len(), 1);
        assert_eq!(state.players[0].socket_id, "s1");
    }

    #[test]
    fn answer_is_write_once_per_question() {
        let mut state = room(quiz(1), GameMode::Solo, ScoringVariant::TimeDecay);
        let tx = channel();
        join(&mut state, &tx, "s1", "Alice");
        open_question(&mut state, 0);

        handle_answer(&mut state, &tx, "s1".into(), 2, 7.0);
        let first_score = state.players[0].score;
        assert!(first_score > 0);

        handle_answer(&mut state, &tx, "s1".into(), 2, 9.0);
        assert_eq!(state.players[0].score, first_score);
        assert_eq!(state.players[0].answers.len(), 1);
    }

    #[test]
    fn time_decay_reference_scenario_scores_850() {
        let mut state = room(quiz(1), GameMode::Solo, ScoringVariant::TimeDecay);
        let tx = channel();
        join(&mut state, &tx, "s1", "Alice");
        open_question(&mut state, 0);

        handle_answer(&mut state, &tx, "s1".into(), 2, 7.0);
        assert_eq!(state.players[0].score, 850);
    }

    #[test]
    fn implausibly_fast_answer_leaves_no_record() {
        let mut state = room(quiz(1), GameMode::Solo, ScoringVariant::TimeDecay);
        let tx = channel();
        join(&mut state, &tx, "s1", "Alice");
        state.phase = RoomPhase::Question;
        state.current = Some(0);
        state.question_start = Some(Instant::now());
        state.players[0].order = Some(AnswerOrder::identity(4));

        handle_answer(&mut state, &tx, "s1".into(), 2, 10.0);
        assert!(state.players[0].answers.is_empty());
        assert_eq!(state.players[0].score, 0);
    }

    #[test]
    fn out_of_range_answer_is_dropped() {
        let mut state = room(quiz(1), GameMode::Solo, ScoringVariant::TimeDecay);
        let tx = channel();
        join(&mut state, &tx, "s1", "Alice");
        open_question(&mut state, 0);

        handle_answer(&mut state, &tx, "s1".into(), 17, 7.0);
        assert!(state.players[0].answers.is_empty());
    }

    #[test]
    fn survivor_elimination_blocks_further_answers() {
        let mut state = room(quiz(2), GameMode::Survivor, ScoringVariant::FlatBonus);
        let tx = channel();
        join(&mut state, &tx, "s1", "Alice");
        open_question(&mut state, 0);

        handle_answer(&mut state, &tx, "s1".into(), 0, 7.0); // wrong
        assert!(state.players[0].eliminated);
        assert_eq!(state.players[0].score, 0);

        open_question(&mut state, 1);
        handle_answer(&mut state, &tx, "s1".into(), 2, 7.0);
        assert!(!state.players[0].answers.contains_key(&1));
    }

    #[test]
    fn streak_tracks_consecutive_correct_answers() {
        let mut state = room(quiz(4), GameMode::Solo, ScoringVariant::FlatBonus);
        let tx = channel();
        join(&mut state, &tx, "s1", "Alice");

        for i in 0..3 {
            open_question(&mut state, i);
            handle_answer(&mut state, &tx, "s1".into(), 2, 5.0);
        }
        assert_eq!(state.players[0].streak, 3);
        assert_eq!(state.players[0].answers[&2].streak_bonus, 10);

        open_question(&mut state, 3);
        handle_answer(&mut state, &tx, "s1".into(), 0, 5.0); // wrong
        assert_eq!(state.players[0].streak, 0);
        assert_eq!(state.players[0].max_streak, 3);
    }

    #[test]
    fn show_results_settles_speed_bonus_and_moves_phase() {
        let mut state = room(quiz(1), GameMode::Solo, ScoringVariant::FlatBonus);
        let tx = channel();
        let registry = Registry::new();
        join(&mut state, &tx, "s1", "Alice");
        join(&mut state, &tx, "s2", "Bob");
        open_question(&mut state, 0);

        handle_answer(&mut state, &tx, "s1".into(), 2, 8.0);
        handle_answer(&mut state, &tx, "s2".into(), 2, 7.0);
        handle_show_results(&mut state, &tx, &registry);

        assert_eq!(state.phase, RoomPhase::Leaderboard);
        for p in &state.players {
            assert_eq!(p.answers[&0].speed_bonus, scoring::SPEED_BONUS_POINTS);
            assert_eq!(p.score, 50 + scoring::SPEED_BONUS_POINTS);
        }

        // Second showResults is a no-op
        let scores: Vec<u32> = state.players.iter().map(|p| p.score).collect();
        handle_show_results(&mut state, &tx, &registry);
        assert_eq!(
            scores,
            state.players.iter().map(|p| p.score).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn phase_sequence_is_lobby_question_leaderboard_finished() {
        let mut state = room(quiz(2), GameMode::Solo, ScoringVariant::TimeDecay);
        let tx = channel();
        let registry = Registry::new();
        let (cmd_tx, _cmd_rx) = mpsc::channel(8);
        join(&mut state, &tx, "s1", "Alice");

        assert_eq!(state.phase, RoomPhase::Lobby);
        advance_question(&mut state, &tx, &registry, &cmd_tx);
        assert_eq!(state.phase, RoomPhase::Question);
        assert_eq!(state.current, Some(0));

        handle_show_results(&mut state, &tx, &registry);
        assert_eq!(state.phase, RoomPhase::Leaderboard);

        advance_question(&mut state, &tx, &registry, &cmd_tx);
        assert_eq!(state.phase, RoomPhase::Question);
        assert_eq!(state.current, Some(1));

        handle_show_results(&mut state, &tx, &registry);
        advance_question(&mut state, &tx, &registry, &cmd_tx);
        assert_eq!(state.phase, RoomPhase::Finished);
    }

    #[test]
    fn results_without_open_question_is_refused() {
        let mut state = room(quiz(1), GameMode::Solo, ScoringVariant::TimeDecay);
        let tx = channel();
        let registry = Registry::new();
        handle_show_results(&mut state, &tx, &registry);
        assert_eq!(state.phase, RoomPhase::Lobby);
    }

    #[test]
    fn shuffled_answers_still_score_canonically() {
        let mut state = room(quiz(1), GameMode::Solo, ScoringVariant::TimeDecay);
        state.shuffle_answers = true;
        let tx = channel();
        join(&mut state, &tx, "s1", "Alice");
        open_question(&mut state, 0);

        // Install a known permutation: presented 0 is canonical 2
        state.players[0].order = Some(AnswerOrder::random(4, &mut rand::rng()));
        let presented = (0..4)
            .find(|&i| state.players[0].order.as_ref().unwrap().canonical(i) == Some(2))
            .unwrap();

        handle_answer(&mut state, &tx, "s1".into(), presented, 7.0);
        let record = &state.players[0].answers[&0];
        assert!(record.correct);
        assert_eq!(record.answer_index, 2);
    }

    #[test]
    fn team_totals_sum_member_scores() {
        let mut state = room(quiz(1), GameMode::Team, ScoringVariant::FlatBonus);
        let tx = channel();
        let registry = Registry::new();
        for (i, name) in ["A", "B", "C", "D", "E", "F"].iter().enumerate() {
            let team = state.teams[i % 2].name.clone();
            handle_join(
                &mut state,
                &tx,
                &registry,
                format!("s{i}"),
                format!("c{i}"),
                name.to_string(),
                Some(team),
            );
        }
        assert_eq!(state.players.len(), 6);
        for (i, p) in state.players.iter_mut().enumerate() {
            p.score = (i as u32 + 1) * 10;
        }
        let totals = state.team_totals();
        let sum: u32 = totals.iter().map(|t| t.score).sum();
        let expected: u32 = state.players.iter().map(|p| p.score).sum();
        assert_eq!(sum, expected);
        assert_eq!(totals.len(), 2);
        assert_eq!(totals[0].score, 10 + 30 + 50);
        assert_eq!(totals[1].score, 20 + 40 + 60);
    }

    #[test]
    fn join_in_team_mode_requires_palette_team() {
        let mut state = room(quiz(1), GameMode::Team, ScoringVariant::TimeDecay);
        let tx = channel();
        let registry = Registry::new();
        handle_join(
            &mut state,
            &tx,
            &registry,
            "s1".into(),
            "c1".into(),
            "Alice".into(),
            Some("NotATeam".into()),
        );
        assert!(state.players.is_empty());
    }

    #[test]
    fn kick_removes_player_and_emits_kick_event() {
        let mut state = room(quiz(1), GameMode::Solo, ScoringVariant::TimeDecay);
        let tx = channel();
        let mut rx = tx.subscribe();
        let registry = Registry::new();
        join(&mut state, &tx, "s1", "Alice");
        let player_id = state.players[0].id.clone();

        // Drain join traffic
        while rx.try_recv().is_ok() {}

        handle_kick(&mut state, &tx, &registry, player_id);
        assert!(state.players.is_empty());
        let mut kicked = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, RoomEvent::Kick { .. }) {
                kicked = true;
            }
        }
        assert!(kicked);
    }

    #[test]
    fn lobby_disconnect_drops_player_mid_game_keeps_score() {
        let mut state = room(quiz(1), GameMode::Solo, ScoringVariant::TimeDecay);
        let tx = channel();
        let registry = Registry::new();
        join(&mut state, &tx, "s1", "Alice");
        handle_disconnect(&mut state, &tx, &registry, "s1".into());
        assert!(state.players.is_empty());

        join(&mut state, &tx, "s2", "Bob");
        open_question(&mut state, 0);
        handle_answer(&mut state, &tx, "s2".into(), 2, 7.0);
        handle_disconnect(&mut state, &tx, &registry, "s2".into());
        assert_eq!(state.players.len(), 1);
        assert!(!state.players[0].connected);
        assert_eq!(state.players[0].score, 850);
    }

    fn settings() -> RoomSettings {
        RoomSettings {
            mode: GameMode::Solo,
            scoring: ScoringVariant::TimeDecay,
            shuffle_answers: false,
            team_count: 2,
            reap_ttl: Duration::from_secs(600),
        }
    }

    #[tokio::test]
    async fn join_ack_reaches_a_subscriber_bound_before_join() {
        let registry = Registry::new();
        let handle = create_room(registry.clone(), "host".into(), quiz(1), settings());

        // Sessions subscribe before sending the join, so the ack and the
        // roster update must land on this receiver.
        let mut rx = handle.event_tx.subscribe();
        handle
            .cmd_tx
            .send(RoomCommand::Join {
                socket_id: "s1".into(),
                client_id: "c1".into(),
                name: "Alice".into(),
                team: None,
            })
            .await
            .unwrap();

        let got_ack = tokio::time::timeout(Duration::from_millis(500), async {
            loop {
                if let RoomEvent::SendTo { socket_id, msg } = rx.recv().await.unwrap() {
                    if socket_id == "s1" && matches!(msg, ServerMsg::PlayerJoined { .. }) {
                        return;
                    }
                }
            }
        })
        .await;
        assert!(got_ack.is_ok());
    }

    #[tokio::test]
    async fn reap_check_only_removes_terminal_rooms() {
        let registry = Registry::new();
        let handle = create_room(registry.clone(), "host".into(), quiz(1), settings());
        let code = handle.code.clone();

        // Not terminal yet: the check is a no-op
        handle.cmd_tx.send(RoomCommand::ReapCheck).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(registry.rooms.contains_key(&code));

        handle
            .cmd_tx
            .send(RoomCommand::End {
                socket_id: "host".into(),
            })
            .await
            .unwrap();
        handle.cmd_tx.send(RoomCommand::ReapCheck).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!registry.rooms.contains_key(&code));
    }

    #[test]
    fn score_never_decreases_over_a_mixed_run() {
        let mut state = room(quiz(4), GameMode::Solo, ScoringVariant::FlatBonus);
        let tx = channel();
        let registry = Registry::new();
        join(&mut state, &tx, "s1", "Alice");

        let mut last = 0;
        for (i, answer) in [2usize, 0, 2, 1].into_iter().enumerate() {
            open_question(&mut state, i);
            handle_answer(&mut state, &tx, "s1".into(), answer, 5.0);
            assert!(state.players[0].score >= last);
            last = state.players[0].score;

            handle_show_results(&mut state, &tx, &registry);
            assert!(state.players[0].score >= last);
            last = state.players[0].score;
        }
    }

    #[test]
    fn finish_reports_ranked_standings() {
        let mut state = room(quiz(1), GameMode::Solo, ScoringVariant::TimeDecay);
        let tx = channel();
        join(&mut state, &tx, "s1", "Alice");
        join(&mut state, &tx, "s2", "Bob");
        state.players[0].score = 100;
        state.players[1].score = 300;

        let standings = state.leaderboard(0);
        assert_eq!(standings[0].name, "Bob");
        assert_eq!(standings[0].rank, 1);
        assert_eq!(standings[1].name, "Alice");
        assert_eq!(standings[1].rank, 2);
    }
}
