//! Database incarnation tracking.
//!
//! A RESETLOGS operation forks the redo timeline: sequences restart at
//! zero under a new resetlogs id. The tracker watches the incarnation
//! history for a child of the current incarnation whose fork point equals
//! the position we have replicated up to, and switches branches when one
//! appears.

use crate::common::error::{ReplicatorError, Result};
use crate::oracle::metadata::Metadata;
use tracing::info;

/// Re-resolve the current incarnation and detect a resetlogs transition.
///
/// Runs entirely under the checkpoint mutex. Returns `true` when a new
/// resetlogs branch was adopted (every per-thread position is zeroed in
/// that case), `false` otherwise. Fails with code 10045 when the current
/// resetlogs id cannot be resolved against a non-empty incarnation list.
pub fn update_resetlogs(metadata: &Metadata) -> Result<bool> {
    metadata.with_checkpoint_lock(|checkpoint| {
        let current_index = checkpoint
            .incarnations()
            .iter()
            .position(|inc| inc.resetlogs == checkpoint.resetlogs());
        checkpoint.set_current_incarnation(current_index);

        if let Some(current) = checkpoint.current_incarnation() {
            let current_incarnation = current.incarnation;
            let current_resetlogs = current.resetlogs;
            let successor = checkpoint
                .incarnations()
                .iter()
                .find(|inc| {
                    inc.resetlogs_scn == checkpoint.next_scn()
                        && current_resetlogs == checkpoint.resetlogs()
                        && inc.prior_incarnation == current_incarnation
                        && inc.resetlogs != checkpoint.resetlogs()
                })
                .cloned();

            if let Some(successor) = successor {
                info!("new resetlogs detected: {}", successor.resetlogs);
                checkpoint.apply_resetlogs(successor.resetlogs);
                let new_index = checkpoint
                    .incarnations()
                    .iter()
                    .position(|inc| inc.incarnation == successor.incarnation);
                checkpoint.set_current_incarnation(new_index);
                return Ok(true);
            }
        }

        if checkpoint.incarnations().is_empty() {
            return Ok(false);
        }

        if checkpoint.current_incarnation().is_none() {
            return Err(ReplicatorError::ResetlogsNotFound {
                resetlogs: checkpoint.resetlogs(),
            });
        }

        Ok(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::ReplicatorConfig;
    use crate::common::types::{DbIncarnation, FileOffset, Scn, Seq};

    fn metadata_with_incarnations() -> Metadata {
        let config = ReplicatorConfig::builder().db_name("TEST").build().unwrap();
        let metadata = Metadata::new(&config);
        metadata.set_incarnations(vec![
            DbIncarnation {
                incarnation: 1,
                prior_incarnation: 0,
                resetlogs: 0xA11CE,
                resetlogs_scn: Scn::new(100),
            },
            DbIncarnation {
                incarnation: 2,
                prior_incarnation: 1,
                resetlogs: 0xB0B,
                resetlogs_scn: Scn::new(500),
            },
        ]);
        metadata
    }

    #[test]
    fn detects_resetlogs_at_fork_point() {
        let metadata = metadata_with_incarnations();
        metadata.set_resetlogs(0xA11CE);
        metadata.set_thread_seq_file_offset(1, Seq::new(42), FileOffset::new(8, 512));
        metadata.set_thread_seq_file_offset(2, Seq::new(17), FileOffset::new(3, 512));
        metadata.set_first_next_scn(1, Scn::new(400), Scn::new(500));

        let detected = update_resetlogs(&metadata).unwrap();
        assert!(detected);
        assert_eq!(metadata.resetlogs(), 0xB0B);
        assert_eq!(metadata.thread_checkpoint(1).sequence, Seq::ZERO);
        assert_eq!(metadata.thread_checkpoint(1).file_offset, FileOffset::zero());
        assert_eq!(metadata.thread_checkpoint(2).sequence, Seq::ZERO);
    }

    #[test]
    fn no_transition_before_fork_point() {
        let metadata = metadata_with_incarnations();
        metadata.set_resetlogs(0xA11CE);
        metadata.set_thread_seq_file_offset(1, Seq::new(42), FileOffset::zero());
        metadata.set_first_next_scn(1, Scn::new(300), Scn::new(400));

        let detected = update_resetlogs(&metadata).unwrap();
        assert!(!detected);
        assert_eq!(metadata.resetlogs(), 0xA11CE);
        assert_eq!(metadata.thread_checkpoint(1).sequence, Seq::new(42));
    }

    #[test]
    fn empty_incarnation_list_is_quiet() {
        let config = ReplicatorConfig::builder().db_name("TEST").build().unwrap();
        let metadata = Metadata::new(&config);
        metadata.set_resetlogs(7);
        assert!(!update_resetlogs(&metadata).unwrap());
    }

    #[test]
    fn unresolved_resetlogs_is_fatal() {
        let metadata = metadata_with_incarnations();
        metadata.set_resetlogs(0xDEAD);
        let err = update_resetlogs(&metadata).unwrap_err();
        assert_eq!(err.code(), 10045);
    }
}
