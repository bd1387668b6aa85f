// =============================================================================
// Journals — persistent, crash-safe record of every intent and stream
// =============================================================================
//
// The journal layer is the sole source of truth for "was this intent
// submitted" and "how much is filled". In-memory stream state is a cached
// read model reconstructed from these files on restart.
// =============================================================================

pub mod execution_journal;
pub mod hydration;
pub mod intent;
pub mod stream_journal;

pub use execution_journal::{ExecutionJournal, JournalEntry};
pub use hydration::{HydrationLog, HydrationRecord, RangesLog, RestoredRange};
pub use intent::Intent;
pub use stream_journal::{StreamJournalRecord, StreamJournalStore};
