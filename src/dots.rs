use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::game::TEAM_PALETTE;
use crate::registry::{DotsHandle, Registry, RoomEvent};
use crate::scoring;
use crate::types::*;

/// Grid bounds, in dots per side.
pub const MIN_GRID: usize = 3;
pub const MAX_GRID: usize = 10;

#[derive(Debug, Clone)]
pub enum DotsCommand {
    Join {
        socket_id: String,
        name: String,
        team: String,
    },
    Answer {
        socket_id: String,
        answer_index: usize,
    },
    Start {
        socket_id: String,
    },
    ShowResults {
        socket_id: String,
    },
    Skip {
        socket_id: String,
    },
    Next {
        socket_id: String,
    },
    DrawLine {
        socket_id: String,
        line: String,
    },
    Kick {
        socket_id: String,
        player_id: String,
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

/// An edge on the dot grid. `row`/`col` index the edge's top-left dot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Horizontal { row: usize, col: usize },
    Vertical { row: usize, col: usize },
}

/// Parse an edge key of the form `h:row:col` or `v:row:col` and check it
/// against the grid bounds. Anything else is rejected.
pub fn parse_edge(key: &str, grid_size: usize) -> Option<Edge> {
    let mut parts = key.split(':');
    let kind = parts.next()?;
    let row: usize = parts.next()?.parse().ok()?;
    let col: usize = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    match kind {
        "h" if row < grid_size && col < grid_size - 1 => Some(Edge::Horizontal { row, col }),
        "v" if row < grid_size - 1 && col < grid_size => Some(Edge::Vertical { row, col }),
        _ => None,
    }
}

fn box_key(row: usize, col: usize) -> String {
    format!("{row}:{col}")
}

/// The boxes an edge borders. At most two; edges on the rim border one.
fn adjacent_boxes(edge: Edge, grid_size: usize) -> Vec<(usize, usize)> {
    let boxes_per_side = grid_size - 1;
    let mut out = Vec::with_capacity(2);
    match edge {
        Edge::Horizontal { row, col } => {
            if row > 0 {
                out.push((row - 1, col));
            }
            if row < boxes_per_side {
                out.push((row, col));
            }
        }
        Edge::Vertical { row, col } => {
            if col > 0 {
                out.push((row, col - 1));
            }
            if col < boxes_per_side {
                out.push((row, col));
            }
        }
    }
    out
}

/// The four edge keys enclosing a box.
fn box_edges(row: usize, col: usize) -> [String; 4] {
    [
        format!("h:{row}:{col}"),
        format!("h:{}:{col}", row + 1),
        format!("v:{row}:{col}"),
        format!("v:{row}:{}", col + 1),
    ]
}

#[derive(Debug, Clone)]
pub struct DotsPlayer {
    pub id: String,
    pub socket_id: String,
    pub connected: bool,
    pub name: String,
    pub team: String,
    pub wins: u32,
}

impl DotsPlayer {
    fn info(&self) -> DotsPlayerInfo {
        DotsPlayerInfo {
            name: self.name.clone(),
            team: self.team.clone(),
            wins: self.wins,
            connected: self.connected,
        }
    }
}

/// One answer receipt for the current question, in arrival order.
#[derive(Debug, Clone)]
struct Receipt {
    player_id: String,
    answer_index: usize,
    correct: bool,
    elapsed_ms: u64,
}

pub struct DotsState {
    pub code: String,
    pub host_socket_id: String,
    pub questions: Vec<Question>,
    pub grid_size: usize,
    pub teams: Vec<Team>,
    pub phase: DotsPhase,
    pub current: Option<usize>,
    pub question_start: Option<Instant>,
    pub players: Vec<DotsPlayer>,
    /// edge key -> owning team
    pub lines: HashMap<String, String>,
    /// box key -> owning team
    pub boxes: HashMap<String, String>,
    /// Player holding an unspent line draw.
    pub pending_winner: Option<String>,
    receipts: Vec<Receipt>,
    pub reap_ttl: Duration,
}

impl DotsState {
    fn broadcast(&self, tx: &broadcast::Sender<RoomEvent>, msg: ServerMsg) {
        let _ = tx.send(RoomEvent::Broadcast { msg });
    }

    fn send_to(&self, tx: &broadcast::Sender<RoomEvent>, socket_id: &str, msg: ServerMsg) {
        let _ = tx.send(RoomEvent::SendTo {
            socket_id: socket_id.to_string(),
            msg,
        });
    }

    fn is_host(&self, socket_id: &str) -> bool {
        socket_id == self.host_socket_id
    }

    fn boxes_per_side(&self) -> usize {
        self.grid_size - 1
    }

    fn total_boxes(&self) -> usize {
        self.boxes_per_side() * self.boxes_per_side()
    }

    fn player_list(&self) -> Vec<DotsPlayerInfo> {
        self.players.iter().map(|p| p.info()).collect()
    }

    fn box_counts(&self) -> Vec<TeamBoxes> {
        self.teams
            .iter()
            .map(|team| TeamBoxes {
                team: team.name.clone(),
                boxes: self
                    .boxes
                    .values()
                    .filter(|owner| owner.as_str() == team.name)
                    .count(),
            })
            .collect()
    }

    /// Winning team by strict box majority; a tie is no winner.
    fn board_winner(&self) -> Option<String> {
        let counts = self.box_counts();
        let best = counts.iter().map(|t| t.boxes).max()?;
        let mut leaders = counts.iter().filter(|t| t.boxes == best);
        let leader = leaders.next()?;
        if leaders.next().is_some() {
            return None;
        }
        Some(leader.team.clone())
    }

    fn summary(&self) -> RoomSummary {
        RoomSummary {
            code: self.code.clone(),
            kind: RoomKind::Dots,
            title: "Dots & Boxes".to_string(),
            state: serde_json::to_value(self.phase)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default(),
            mode: None,
            player_count: self.players.len(),
            players: self.players.iter().map(|p| p.name.clone()).collect(),
            progress: QuestionProgress {
                current: self.current.map(|i| i + 1).unwrap_or(0),
                total: self.questions.len(),
            },
        }
    }

    fn publish(&self, registry: &Registry) {
        registry.publish_summary(self.summary());
    }
}

fn dots_teams() -> Vec<Team> {
    TEAM_PALETTE
        .iter()
        .take(2)
        .map(|(name, color, emoji)| Team {
            name: name.to_string(),
            color: color.to_string(),
            emoji: emoji.to_string(),
        })
        .collect()
}

/// Create a line-drawing room and spawn its task.
pub fn create_dots_room(
    registry: Arc<Registry>,
    host_socket_id: String,
    questions: Vec<Question>,
    grid_size: usize,
    reap_ttl: Duration,
) -> DotsHandle {
    let code = registry.allocate_code();

    let (cmd_tx, cmd_rx) = mpsc::channel(256);
    let (event_tx, _) = broadcast::channel(256);

    let handle = DotsHandle {
        code: code.clone(),
        cmd_tx: cmd_tx.clone(),
        event_tx: event_tx.clone(),
    };
    registry.dots_rooms.insert(code.clone(), handle.clone());

    let state = DotsState {
        code: code.clone(),
        host_socket_id,
        questions,
        grid_size: grid_size.clamp(MIN_GRID, MAX_GRID),
        teams: dots_teams(),
        phase: DotsPhase::Lobby,
        current: None,
        question_start: None,
        players: Vec::new(),
        lines: HashMap::new(),
        boxes: HashMap::new(),
        pending_winner: None,
        receipts: Vec::new(),
        reap_ttl,
    };
    state.publish(&registry);

    tokio::spawn(dots_task(state, cmd_rx, cmd_tx, event_tx, registry));
    tracing::info!("Dots room created: {}", code);

    handle
}

async fn dots_task(
    mut state: DotsState,
    mut cmd_rx: mpsc::Receiver<DotsCommand>,
    cmd_tx: mpsc::Sender<DotsCommand>,
    event_tx: broadcast::Sender<RoomEvent>,
    registry: Arc<Registry>,
) {
    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            DotsCommand::Join {
                socket_id,
                name,
                team,
            } => {
                handle_join(&mut state, &event_tx, &registry, socket_id, name, team);
            }
            DotsCommand::Answer {
                socket_id,
                answer_index,
            } => {
                handle_answer(&mut state, &event_tx, socket_id, answer_index);
            }
            DotsCommand::Start { socket_id } => {
                if state.is_host(&socket_id) && state.phase == DotsPhase::Lobby {
                    advance_question(&mut state, &event_tx, &registry, &cmd_tx);
                }
            }
            DotsCommand::ShowResults { socket_id } => {
                if state.is_host(&socket_id) {
                    handle_show_results(&mut state, &event_tx, &registry);
                }
            }
            DotsCommand::Skip { socket_id } => {
                if state.is_host(&socket_id) && state.phase == DotsPhase::Question {
                    advance_question(&mut state, &event_tx, &registry, &cmd_tx);
                }
            }
            DotsCommand::Next { socket_id } => {
                if state.is_host(&socket_id) && state.phase == DotsPhase::Results {
                    advance_question(&mut state, &event_tx, &registry, &cmd_tx);
                }
            }
            DotsCommand::DrawLine { socket_id, line } => {
                handle_draw_line(&mut state, &event_tx, &registry, &cmd_tx, socket_id, line);
            }
            DotsCommand::Kick {
                socket_id,
                player_id,
            } => {
                if state.is_host(&socket_id) {
                    handle_kick(&mut state, &event_tx, &registry, player_id);
                }
            }
            DotsCommand::AdminKickPlayer { player_id } => {
                handle_kick(&mut state, &event_tx, &registry, player_id);
            }
            DotsCommand::Disconnect { socket_id } => {
                handle_disconnect(&mut state, &event_tx, &registry, socket_id);
            }
            DotsCommand::Close => {
                state.broadcast(
                    &event_tx,
                    ServerMsg::Error {
                        message: "Room closed".to_string(),
                    },
                );
                registry.remove_dots_room(&state.code);
                break;
            }
            DotsCommand::ReapCheck => {
                if state.phase == DotsPhase::Finished {
                    registry.remove_dots_room(&state.code);
                    break;
                }
            }
        }
    }

    registry.remove_dots_room(&state.code);
    tracing::info!("Dots room {} task ended", state.code);
}

fn handle_join(
    state: &mut DotsState,
    tx: &broadcast::Sender<RoomEvent>,
    registry: &Registry,
    socket_id: String,
    name: String,
    team: String,
) {
    if state.phase != DotsPhase::Lobby {
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
    let Some(team) = state.teams.iter().find(|t| t.name == team) else {
        state.send_to(
            tx,
            &socket_id,
            ServerMsg::Error {
                message: "Pick a team".to_string(),
            },
        );
        return;
    };
    let team = team.name.clone();

    state.players.push(DotsPlayer {
        id: Uuid::new_v4().to_string(),
        socket_id: socket_id.clone(),
        connected: true,
        name: name.clone(),
        team: team.clone(),
        wins: 0,
    });

    state.send_to(
        tx,
        &socket_id,
        ServerMsg::DotsJoined {
            code: state.code.clone(),
            name,
            team,
        },
    );
    let list = state.player_list();
    state.broadcast(tx, ServerMsg::DotsPlayerList { players: list });
    state.publish(registry);
}

fn handle_answer(
    state: &mut DotsState,
    tx: &broadcast::Sender<RoomEvent>,
    socket_id: String,
    answer_index: usize,
) {
    if state.phase != DotsPhase::Question {
        return;
    }
    let Some(index) = state.current else { return };
    let question = &state.questions[index];
    let Some(start) = state.question_start else {
        return;
    };
    let elapsed_ms = start.elapsed().as_millis() as u64;
    if elapsed_ms < scoring::MIN_ANSWER_MS {
        return;
    }
    if answer_index >= question.answers.len() {
        return;
    }
    let Some(player) = state.players.iter().find(|p| p.socket_id == socket_id) else {
        return;
    };
    let player_id = player.id.clone();
    if state.receipts.iter().any(|r| r.player_id == player_id) {
        return;
    }

    let correct = answer_index == question.correct;
    state.receipts.push(Receipt {
        player_id,
        answer_index,
        correct,
        elapsed_ms,
    });

    state.send_to(tx, &socket_id, ServerMsg::DotsAnswerResult { correct });
    let count = state.receipts.len();
    let total = state.players.len();
    state.broadcast(tx, ServerMsg::DotsAnswered { count, total });
}

fn advance_question(
    state: &mut DotsState,
    tx: &broadcast::Sender<RoomEvent>,
    registry: &Registry,
    cmd_tx: &mpsc::Sender<DotsCommand>,
) {
    let next = state.current.map(|i| i + 1).unwrap_or(0);
    if next >= state.questions.len() {
        finish_game(state, tx, registry, cmd_tx);
        return;
    }

    state.current = Some(next);
    state.phase = DotsPhase::Question;
    state.question_start = Some(Instant::now());
    state.receipts.clear();
    // An unspent draw is forfeit once the next question opens
    state.pending_winner = None;

    let question = &state.questions[next];
    state.broadcast(
        tx,
        ServerMsg::DotsQuestion {
            index: next,
            total: state.questions.len(),
            question: PublicQuestion {
                question: question.question.clone(),
                answers: question.answers.clone(),
                time: question.time,
                image: question.image.clone(),
                double_points: question.double_points,
            },
        },
    );
    state.publish(registry);
}

/// Reveal the question. The fastest correct responder earns the line draw;
/// ties keep the earlier arrival.
fn handle_show_results(
    state: &mut DotsState,
    tx: &broadcast::Sender<RoomEvent>,
    registry: &Registry,
) {
    if state.phase != DotsPhase::Question {
        return;
    }
    let Some(index) = state.current else { return };
    let question = &state.questions[index];

    let mut counts = vec![0usize; question.answers.len()];
    for receipt in &state.receipts {
        if let Some(slot) = counts.get_mut(receipt.answer_index) {
            *slot += 1;
        }
    }

    let mut fastest: Option<&Receipt> = None;
    for receipt in state.receipts.iter().filter(|r| r.correct) {
        match fastest {
            // strictly-less keeps the first arrival on a tie
            Some(best) if receipt.elapsed_ms >= best.elapsed_ms => {}
            _ => fastest = Some(receipt),
        }
    }
    let winner_id = fastest.map(|r| r.player_id.clone());
    let correct = question.correct;

    state.phase = DotsPhase::Results;

    let winner = winner_id.as_ref().and_then(|id| {
        let player = state.players.iter_mut().find(|p| &p.id == id)?;
        player.wins += 1;
        Some(DotsWinner {
            name: player.name.clone(),
            team: player.team.clone(),
        })
    });
    state.pending_winner = winner.is_some().then(|| winner_id.clone()).flatten();

    state.broadcast(
        tx,
        ServerMsg::DotsResults {
            correct,
            counts,
            winner,
        },
    );
    if let Some(id) = &state.pending_winner {
        if let Some(player) = state.players.iter().find(|p| &p.id == id) {
            let socket = player.socket_id.clone();
            let grid_size = state.grid_size;
            state.send_to(tx, &socket, ServerMsg::DotsYourTurn { grid_size });
        }
    }
    let list = state.player_list();
    state.broadcast(tx, ServerMsg::DotsPlayerList { players: list });
    state.publish(registry);
}

fn handle_draw_line(
    state: &mut DotsState,
    tx: &broadcast::Sender<RoomEvent>,
    registry: &Registry,
    cmd_tx: &mpsc::Sender<DotsCommand>,
    socket_id: String,
    line: String,
) {
    // Only the current winner holds a draw, and only one
    let Some(winner_id) = state.pending_winner.clone() else {
        return;
    };
    let Some(player) = state.players.iter().find(|p| p.socket_id == socket_id) else {
        return;
    };
    if player.id != winner_id {
        return;
    }
    let team = player.team.clone();

    let Some(edge) = parse_edge(&line, state.grid_size) else {
        return;
    };
    if state.lines.contains_key(&line) {
        return;
    }

    state.lines.insert(line.clone(), team.clone());
    state.pending_winner = None;

    // Every box this edge closes goes to the drawing team, instantly
    let mut claims = Vec::new();
    for (row, col) in adjacent_boxes(edge, state.grid_size) {
        let key = box_key(row, col);
        if state.boxes.contains_key(&key) {
            continue;
        }
        if box_edges(row, col)
            .iter()
            .all(|e| state.lines.contains_key(e))
        {
            state.boxes.insert(key.clone(), team.clone());
            claims.push(BoxClaim {
                key,
                team: team.clone(),
            });
        }
    }

    let counts = state.box_counts();
    state.broadcast(
        tx,
        ServerMsg::DotsLineDrawn {
            line,
            team,
            boxes: claims,
            counts,
        },
    );

    if state.boxes.len() == state.total_boxes() {
        finish_game(state, tx, registry, cmd_tx);
    }
}

fn finish_game(
    state: &mut DotsState,
    tx: &broadcast::Sender<RoomEvent>,
    registry: &Registry,
    cmd_tx: &mpsc::Sender<DotsCommand>,
) {
    state.phase = DotsPhase::Finished;
    state.pending_winner = None;

    state.broadcast(
        tx,
        ServerMsg::DotsEnd {
            winner: state.board_winner(),
            counts: state.box_counts(),
        },
    );
    state.publish(registry);

    let reap_tx = cmd_tx.clone();
    let ttl = state.reap_ttl;
    tokio::spawn(async move {
        tokio::time::sleep(ttl).await;
        let _ = reap_tx.send(DotsCommand::ReapCheck).await;
    });
}

fn handle_kick(
    state: &mut DotsState,
    tx: &broadcast::Sender<RoomEvent>,
    registry: &Registry,
    player_id: String,
) {
    let Some(pos) = state.players.iter().position(|p| p.id == player_id) else {
        return;
    };
    let player = state.players.remove(pos);
    if state.pending_winner.as_deref() == Some(player.id.as_str()) {
        state.pending_winner = None;
    }
    let _ = tx.send(RoomEvent::Kick {
        socket_id: player.socket_id,
        msg: ServerMsg::DotsKicked {
            message: "You have been removed from the game".to_string(),
        },
    });
    let list = state.player_list();
    state.broadcast(tx, ServerMsg::DotsPlayerList { players: list });
    state.publish(registry);
}

fn handle_disconnect(
    state: &mut DotsState,
    tx: &broadcast::Sender<RoomEvent>,
    registry: &Registry,
    socket_id: String,
) {
    if state.is_host(&socket_id) {
        return;
    }
    let Some(pos) = state.players.iter().position(|p| p.socket_id == socket_id) else {
        return;
    };
    if state.phase == DotsPhase::Lobby {
        state.players.remove(pos);
    } else {
        state.players[pos].connected = false;
    }
    let list = state.player_list();
    state.broadcast(tx, ServerMsg::DotsPlayerList { players: list });
    state.publish(registry);
}
