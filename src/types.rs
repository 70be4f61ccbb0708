use serde::{Deserialize, Serialize};

/// A single question in a quiz.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    pub question: String,
    pub answers: Vec<String>,
    pub correct: usize,
    /// Answer window in seconds.
    pub time: u64,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub double_points: bool,
}

/// A quiz as supplied by the host on room creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quiz {
    pub title: String,
    pub questions: Vec<Question>,
}

/// Game variants supported by a quiz room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GameMode {
    #[default]
    Solo,
    Team,
    Survivor,
}

/// Point policy applied to answer submissions. Both variants ship; a room
/// picks one at creation and holds it for the whole game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ScoringVariant {
    #[default]
    #[serde(rename = "time-decay")]
    TimeDecay,
    #[serde(rename = "flat-bonus")]
    FlatBonus,
}

/// Quiz room lifecycle. `finished` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomPhase {
    Lobby,
    Question,
    Leaderboard,
    Finished,
}

/// Line-drawing room lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DotsPhase {
    Lobby,
    Question,
    Results,
    Finished,
}

/// A team slot, assigned from the fixed palette at room creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Team {
    pub name: String,
    pub color: String,
    pub emoji: String,
}

/// One scored answer. `answer_index` is canonical, already mapped back
/// through the player's shuffle permutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerRecord {
    pub answer_index: usize,
    pub correct: bool,
    pub elapsed_ms: u64,
    pub base_points: u32,
    pub speed_bonus: u32,
    pub streak_bonus: u32,
}

impl AnswerRecord {
    pub fn total(&self) -> u32 {
        self.base_points + self.speed_bonus + self.streak_bonus
    }
}

/// Roster view of a player, safe to send to the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerInfo {
    pub id: String,
    pub name: String,
    pub team: Option<String>,
    pub score: u32,
    pub streak: u32,
    pub eliminated: bool,
    pub connected: bool,
}

/// One row of a ranked leaderboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub name: String,
    pub score: u32,
    pub team: Option<String>,
}

/// Aggregated team score, reported at the finished transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamTotal {
    pub team: String,
    pub color: String,
    pub emoji: String,
    pub score: u32,
}

/// Current question progress.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QuestionProgress {
    pub current: usize,
    pub total: usize,
}

/// Which engine a room runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomKind {
    Quiz,
    Dots,
}

/// Read projection of one live room for the admin channel. Recomputed by
/// the owning room task on every mutation, never diffed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub code: String,
    pub kind: RoomKind,
    pub title: String,
    pub state: String,
    pub mode: Option<GameMode>,
    pub player_count: usize,
    pub players: Vec<String>,
    pub progress: QuestionProgress,
}

/// Question payload as players and displays see it: no correct index.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicQuestion {
    pub question: String,
    pub answers: Vec<String>,
    pub time: u64,
    pub image: Option<String>,
    pub double_points: bool,
}

/// Team box tally for the line-drawing game.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamBoxes {
    pub team: String,
    pub boxes: usize,
}

/// A box claimed by a completing line draw.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoxClaim {
    pub key: String,
    pub team: String,
}

/// Roster view of a line-drawing player.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DotsPlayerInfo {
    pub name: String,
    pub team: String,
    pub wins: u32,
    pub connected: bool,
}

/// The question winner in a line-drawing round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DotsWinner {
    pub name: String,
    pub team: String,
}

/// Messages sent from clients to the server via WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMsg {
    // Host actions
    #[serde(rename = "host:create", rename_all = "camelCase")]
    HostCreate {
        quiz: Quiz,
        #[serde(default)]
        mode: GameMode,
        #[serde(default)]
        scoring: Option<ScoringVariant>,
        #[serde(default)]
        team_count: Option<usize>,
    },
    #[serde(rename = "host:start")]
    HostStart { code: String },
    #[serde(rename = "host:showResults")]
    HostShowResults { code: String },
    #[serde(rename = "host:next")]
    HostNext { code: String },
    #[serde(rename = "host:skipQuestion")]
    HostSkipQuestion { code: String },
    #[serde(rename = "host:pause")]
    HostPause { code: String },
    #[serde(rename = "host:resume")]
    HostResume { code: String },
    #[serde(rename = "host:renamePlayer", rename_all = "camelCase")]
    HostRenamePlayer {
        code: String,
        player_id: String,
        name: String,
    },
    #[serde(rename = "host:kickPlayer", rename_all = "camelCase")]
    HostKickPlayer { code: String, player_id: String },
    #[serde(rename = "host:endGame")]
    HostEndGame { code: String },
    #[serde(rename = "host:syncDisplay")]
    HostSyncDisplay { code: String },

    // Player actions
    #[serde(rename = "player:join")]
    PlayerJoin {
        code: String,
        name: String,
        #[serde(default)]
        team: Option<String>,
    },
    #[serde(rename = "player:answer", rename_all = "camelCase")]
    PlayerAnswer {
        code: String,
        answer_index: usize,
        time_left: f64,
    },
    #[serde(rename = "player:reaction")]
    PlayerReaction { code: String, emoji: String },

    // Display
    #[serde(rename = "display:join")]
    DisplayJoin { code: String },

    // Line-drawing game
    #[serde(rename = "dots:create", rename_all = "camelCase")]
    DotsCreate {
        questions: Vec<Question>,
        grid_size: usize,
    },
    #[serde(rename = "dots:join")]
    DotsJoin {
        code: String,
        name: String,
        team: String,
    },
    #[serde(rename = "dots:start")]
    DotsStart { code: String },
    #[serde(rename = "dots:answer", rename_all = "camelCase")]
    DotsAnswer { code: String, answer_index: usize },
    #[serde(rename = "dots:showResults")]
    DotsShowResults { code: String },
    #[serde(rename = "dots:skip")]
    DotsSkip { code: String },
    #[serde(rename = "dots:next")]
    DotsNext { code: String },
    #[serde(rename = "dots:drawLine")]
    DotsDrawLine { code: String, line: String },
    #[serde(rename = "dots:kick", rename_all = "camelCase")]
    DotsKick { code: String, player_id: String },

    // Admin
    #[serde(rename = "admin:subscribe")]
    AdminSubscribe { password: String },
    #[serde(rename = "admin:getRooms")]
    AdminGetRooms,
    #[serde(rename = "admin:kickPlayer", rename_all = "camelCase")]
    AdminKickPlayer { code: String, player_id: String },
    #[serde(rename = "admin:closeRoom")]
    AdminCloseRoom { code: String },
}

/// Messages sent from the server to clients via WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMsg {
    #[serde(rename = "error")]
    Error { message: String },

    // Host
    #[serde(rename = "host:created")]
    HostCreated { code: String },
    #[serde(rename = "host:question")]
    HostQuestion {
        index: usize,
        total: usize,
        question: Question,
    },
    #[serde(rename = "host:results", rename_all = "camelCase")]
    HostResults {
        correct: usize,
        counts: Vec<usize>,
        leaderboard: Vec<LeaderboardEntry>,
        is_last: bool,
    },
    #[serde(rename = "host:answeredCount")]
    HostAnsweredCount { count: usize, total: usize },
    #[serde(rename = "host:playerList")]
    HostPlayerList { players: Vec<PlayerInfo> },
    #[serde(rename = "host:suspiciousActivity", rename_all = "camelCase")]
    HostSuspiciousActivity {
        names: Vec<String>,
        correct_count: usize,
        window_ms: u64,
    },

    // Game broadcasts
    #[serde(rename = "game:question")]
    GameQuestion {
        index: usize,
        total: usize,
        question: PublicQuestion,
    },
    #[serde(rename = "game:results", rename_all = "camelCase")]
    GameResults {
        correct: usize,
        counts: Vec<usize>,
        leaderboard: Vec<LeaderboardEntry>,
        is_last: bool,
    },
    #[serde(rename = "game:end", rename_all = "camelCase")]
    GameEnd {
        #[serde(rename = "final")]
        final_standings: Vec<LeaderboardEntry>,
        team_totals: Option<Vec<TeamTotal>>,
    },
    #[serde(rename = "game:paused")]
    GamePaused,
    #[serde(rename = "game:resumed")]
    GameResumed,

    // Player
    #[serde(rename = "player:joined", rename_all = "camelCase")]
    PlayerJoined {
        player_id: String,
        code: String,
        name: String,
        team: Option<String>,
    },
    #[serde(rename = "player:rejoined", rename_all = "camelCase")]
    PlayerRejoined {
        player_id: String,
        name: String,
        score: u32,
        streak: u32,
        phase: RoomPhase,
        progress: QuestionProgress,
    },
    #[serde(rename = "player:answered")]
    PlayerAnswered { count: usize, total: usize },
    #[serde(rename = "player:answerResult")]
    PlayerAnswerResult {
        correct: bool,
        points: u32,
        score: u32,
        streak: u32,
    },
    #[serde(rename = "player:eliminated")]
    PlayerEliminated,
    #[serde(rename = "player:kicked")]
    PlayerKicked { message: String },
    #[serde(rename = "player:renamed")]
    PlayerRenamed { name: String },

    // Display
    #[serde(rename = "display:sync")]
    DisplaySync {
        phase: RoomPhase,
        progress: QuestionProgress,
        question: Option<PublicQuestion>,
    },
    #[serde(rename = "display:joined")]
    DisplayJoined { code: String, title: String },
    #[serde(rename = "display:error")]
    DisplayError { message: String },
    #[serde(rename = "display:reaction")]
    DisplayReaction { name: String, emoji: String },
    #[serde(rename = "display:end", rename_all = "camelCase")]
    DisplayEnd {
        #[serde(rename = "final")]
        final_standings: Vec<LeaderboardEntry>,
        team_totals: Option<Vec<TeamTotal>>,
    },

    // Line-drawing game
    #[serde(rename = "dots:created", rename_all = "camelCase")]
    DotsCreated {
        code: String,
        grid_size: usize,
        teams: Vec<Team>,
    },
    #[serde(rename = "dots:joined")]
    DotsJoined {
        code: String,
        name: String,
        team: String,
    },
    #[serde(rename = "dots:playerList")]
    DotsPlayerList { players: Vec<DotsPlayerInfo> },
    #[serde(rename = "dots:question")]
    DotsQuestion {
        index: usize,
        total: usize,
        question: PublicQuestion,
    },
    #[serde(rename = "dots:results")]
    DotsResults {
        correct: usize,
        counts: Vec<usize>,
        winner: Option<DotsWinner>,
    },
    #[serde(rename = "dots:answerResult")]
    DotsAnswerResult { correct: bool },
    #[serde(rename = "dots:answered")]
    DotsAnswered { count: usize, total: usize },
    #[serde(rename = "dots:yourTurn", rename_all = "camelCase")]
    DotsYourTurn { grid_size: usize },
    #[serde(rename = "dots:lineDrawn")]
    DotsLineDrawn {
        line: String,
        team: String,
        boxes: Vec<BoxClaim>,
        counts: Vec<TeamBoxes>,
    },
    #[serde(rename = "dots:end")]
    DotsEnd {
        winner: Option<String>,
        counts: Vec<TeamBoxes>,
    },
    #[serde(rename = "dots:kicked")]
    DotsKicked { message: String },

    // Admin
    #[serde(rename = "admin:rooms")]
    AdminRooms { rooms: Vec<RoomSummary> },
    #[serde(rename = "admin:error")]
    AdminError { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_msg_wire_tags() {
        let msg: ClientMsg = serde_json::from_str(
            r#"{"type":"player:answer","code":"123456","answerIndex":2,"timeLeft":7.0}"#,
        )
        .unwrap();
        match msg {
            ClientMsg::PlayerAnswer {
                code,
                answer_index,
                time_left,
            } => {
                assert_eq!(code, "123456");
                assert_eq!(answer_index, 2);
                assert_eq!(time_left, 7.0);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn negative_answer_index_is_a_protocol_error() {
        let res = serde_json::from_str::<ClientMsg>(
            r#"{"type":"player:answer","code":"123456","answerIndex":-1,"timeLeft":7.0}"#,
        );
        assert!(res.is_err());
    }

    #[test]
    fn server_msg_final_field_name() {
        let msg = ServerMsg::GameEnd {
            final_standings: vec![],
            team_totals: None,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "game:end");
        assert!(json.get("final").is_some());
    }

    #[test]
    fn question_defaults() {
        let q: Question = serde_json::from_str(
            r#"{"question":"2+2?","answers":["3","4"],"correct":1,"time":10}"#,
        )
        .unwrap();
        assert!(!q.double_points);
        assert!(q.image.is_none());
    }

    #[test]
    fn dots_create_wire_shape() {
        let msg: ClientMsg = serde_json::from_str(
            r#"{"type":"dots:create","questions":[],"gridSize":5}"#,
        )
        .unwrap();
        assert!(matches!(msg, ClientMsg::DotsCreate { grid_size: 5, .. }));
    }
}
