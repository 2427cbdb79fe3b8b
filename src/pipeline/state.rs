//! Request pipeline states and their legal transitions.
//!
//! ```text
//! ResolvingSource ─► CheckingVariantCache ─┬─► StreamingCached ─────────────────────► Done
//!        ▲                  │               └─► ReadingInfo ─► Decoding ─► Processing
//!        └──────────────────┘ (stat after a miss)                            │
//!                                               EncodingAndCaching ◄─────────┘ ─► Done
//!
//! any state ─► Error
//! ```

use std::fmt;

use crate::error::ImageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineState {
    ResolvingSource,
    CheckingVariantCache,
    StreamingCached,
    ReadingInfo,
    Decoding,
    Processing,
    EncodingAndCaching,
    Done,
    Error,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::ResolvingSource => "resolving_source",
            PipelineState::CheckingVariantCache => "checking_variant_cache",
            PipelineState::StreamingCached => "streaming_cached",
            PipelineState::ReadingInfo => "reading_info",
            PipelineState::Decoding => "decoding",
            PipelineState::Processing => "processing",
            PipelineState::EncodingAndCaching => "encoding_and_caching",
            PipelineState::Done => "done",
            PipelineState::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Error)
    }

    /// Whether `next` may follow `self`.
    pub fn can_transition_to(&self, next: PipelineState) -> bool {
        use PipelineState::*;

        if next == Error {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (ResolvingSource, CheckingVariantCache)
                | (ResolvingSource, ReadingInfo)
                | (CheckingVariantCache, StreamingCached)
                | (CheckingVariantCache, ReadingInfo)
                | (CheckingVariantCache, ResolvingSource)
                | (StreamingCached, Done)
                | (ReadingInfo, Decoding)
                | (Decoding, Processing)
                | (Processing, EncodingAndCaching)
                | (EncodingAndCaching, Done)
        )
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Records the path a request takes through the pipeline.
#[derive(Debug, Clone, Default)]
pub struct StateTracker {
    path: Vec<PipelineState>,
}

impl StateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<PipelineState> {
        self.path.last().copied()
    }

    /// Move to `next`.
    ///
    /// # Errors
    ///
    /// Returns `IllegalState` if `next` may not follow the current state.
    pub fn advance(&mut self, next: PipelineState) -> Result<(), ImageError> {
        let allowed = match self.current() {
            None => matches!(
                next,
                PipelineState::ResolvingSource | PipelineState::CheckingVariantCache
            ),
            Some(current) => current.can_transition_to(next),
        };
        if !allowed {
            let from = self.current().map(|s| s.as_str()).unwrap_or("start");
            return Err(ImageError::IllegalState(format!(
                "{} -> {}",
                from,
                next.as_str()
            )));
        }
        tracing::trace!(state = next.as_str(), "Pipeline transition");
        self.path.push(next);
        Ok(())
    }

    /// Enter the error state unless already terminal.
    pub fn fail(&mut self) {
        if self.current().map_or(true, |s| !s.is_terminal()) {
            self.path.push(PipelineState::Error);
        }
    }

    pub fn path(&self) -> &[PipelineState] {
        &self.path
    }

    pub fn into_path(self) -> Vec<PipelineState> {
        self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use PipelineState::*;

    #[test]
    fn test_miss_path_is_legal() {
        let mut tracker = StateTracker::new();
        for state in [
            ResolvingSource,
            CheckingVariantCache,
            ReadingInfo,
            Decoding,
            Processing,
            EncodingAndCaching,
            Done,
        ] {
            tracker.advance(state).unwrap();
        }
        assert_eq!(tracker.current(), Some(Done));
    }

    #[test]
    fn test_hit_without_resolving_first() {
        let mut tracker = StateTracker::new();
        tracker.advance(CheckingVariantCache).unwrap();
        tracker.advance(StreamingCached).unwrap();
        tracker.advance(Done).unwrap();
        assert_eq!(tracker.path(), &[CheckingVariantCache, StreamingCached, Done]);
    }

    #[test]
    fn test_skipping_states_is_illegal() {
        let mut tracker = StateTracker::new();
        tracker.advance(ResolvingSource).unwrap();
        let err = tracker.advance(Processing).unwrap_err();
        assert!(matches!(err, ImageError::IllegalState(msg) if msg.contains("processing")));
        assert!(StateTracker::new().advance(Decoding).is_err());
    }

    #[test]
    fn test_error_reachable_until_terminal() {
        let mut tracker = StateTracker::new();
        tracker.advance(ResolvingSource).unwrap();
        tracker.fail();
        assert_eq!(tracker.current(), Some(Error));
        tracker.fail();
        assert_eq!(tracker.path().len(), 2);
        assert!(!Done.can_transition_to(Error));
    }
}
