use crate::{
    address::{
        Address,
        WEI_PER_ETHER,
        Wei,
    },
    queue::{
        QueueEntry,
        project,
    },
    snapshot::Snapshot,
};
use std::fmt;

/// Below this many seconds the countdown is urgent.
pub const URGENT_BELOW_SECONDS: u64 = 600;
/// Below this many seconds the countdown is critical.
pub const CRITICAL_BELOW_SECONDS: u64 = 120;

const DISPLAY_DECIMALS: u32 = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Urgency {
    Normal,
    Urgent,
    Critical,
}

impl Urgency {
    pub fn from_seconds(seconds: u64) -> Self {
        if seconds < CRITICAL_BELOW_SECONDS {
            Urgency::Critical
        } else if seconds < URGENT_BELOW_SECONDS {
            Urgency::Urgent
        } else {
            Urgency::Normal
        }
    }

    pub fn banner(self) -> &'static str {
        match self {
            Urgency::Critical => "LESS THAN 2 MINUTES!",
            Urgency::Urgent => "LESS THAN 10 MINUTES LEFT",
            Urgency::Normal => "Every transaction resets the 42-minute countdown",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UiState {
    Active(Urgency),
    Ended,
}

/// `game_ended` wins over everything else, including a countdown that still runs.
pub fn classify(snapshot: &Snapshot) -> UiState {
    if snapshot.game_ended {
        return UiState::Ended;
    }
    UiState::Active(Urgency::from_seconds(snapshot.time_remaining_seconds))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Countdown {
    pub minutes: u64,
    pub seconds: u64,
}

impl Countdown {
    pub fn from_seconds(total: u64) -> Self {
        Self {
            minutes: total / 60,
            seconds: total % 60,
        }
    }
}

impl fmt::Display for Countdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.minutes, self.seconds)
    }
}

/// Ether amount rounded half-up to four decimals, e.g. `"0.1235"`.
pub fn format_ether(wei: Wei) -> String {
    let unit = WEI_PER_ETHER / 10u128.pow(DISPLAY_DECIMALS);
    let scaled = wei.saturating_add(unit / 2) / unit;
    let scale = 10u128.pow(DISPLAY_DECIMALS);
    format!(
        "{}.{:0width$}",
        scaled / scale,
        scaled % scale,
        width = DISPLAY_DECIMALS as usize
    )
}

/// Approximate dollar value at a reference price, formatted to cents.
pub fn format_usd(wei: Wei, eth_usd_price: f64) -> String {
    let ether = wei as f64 / WEI_PER_ETHER as f64;
    let usd = ether * eth_usd_price;
    if usd.is_finite() && usd >= 0.0 {
        format!("{usd:.2}")
    } else {
        "0.00".to_string()
    }
}

/// Everything a presentation layer needs for one frame, recomputed per snapshot.
#[derive(Clone, Debug, PartialEq)]
pub struct GameView {
    pub state: UiState,
    pub countdown: Countdown,
    pub pot_eth: String,
    pub pot_usd: String,
    pub payout_eth: String,
    pub payout_usd: String,
    pub total_entries: u64,
    pub game_active: bool,
    /// The ledger allows ending the game but has not ended it yet.
    pub show_end_game: bool,
    pub show_batch_payout: bool,
    pub accepting_entries: bool,
    pub queue: Vec<QueueEntry>,
    pub viewer_in_queue: bool,
}

impl GameView {
    pub fn derive(snapshot: &Snapshot, viewer: Option<&Address>, eth_usd_price: f64) -> Self {
        let state = classify(snapshot);
        let ended = matches!(state, UiState::Ended);
        let queue = project(snapshot.queue.as_slice(), viewer);
        let viewer_in_queue = queue.iter().any(|entry| entry.is_viewer);
        Self {
            state,
            countdown: Countdown::from_seconds(snapshot.time_remaining_seconds),
            pot_eth: format_ether(snapshot.pot_value),
            pot_usd: format_usd(snapshot.pot_value, eth_usd_price),
            payout_eth: format_ether(snapshot.estimated_payout_per_winner),
            payout_usd: format_usd(snapshot.estimated_payout_per_winner, eth_usd_price),
            total_entries: snapshot.total_entries,
            game_active: snapshot.game_active,
            show_end_game: snapshot.can_end_game && !ended,
            show_batch_payout: ended,
            accepting_entries: !ended,
            queue,
            viewer_in_queue,
        }
    }

    pub fn banner(&self) -> &'static str {
        match self.state {
            UiState::Active(urgency) => urgency.banner(),
            UiState::Ended => "GAME OVER",
        }
    }
}
