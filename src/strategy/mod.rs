// Trading strategy module: the seam to the signal-generating layer
pub mod reclamation;

use crate::models::{Candle, EntrySignal};
use crate::Result;

pub use reclamation::ReclamationStrategy;

/// Base trait for all entry-signal strategies.
///
/// Implementations are pure evaluations over a bar series; the
/// orchestrator decides when to call them and what to do with the result.
pub trait Strategy: Send + Sync {
    /// Evaluate the latest bars for one (symbol, timeframe) pair.
    /// `None` means no entry condition right now.
    fn generate_signal(&self, candles: &[Candle]) -> Result<Option<EntrySignal>>;

    /// Strategy name for logging
    fn name(&self) -> &str;

    /// Minimum bars required before evaluation makes sense
    fn min_candles_required(&self) -> usize;
}
