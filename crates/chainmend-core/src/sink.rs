//! Write seam between the committer and the replica.

use crate::error::ReplicaError;
use crate::record::StateChangeRecord;

/// Destination of backfilled records.
///
/// Transactions are explicit: the committer opens one with [`begin`], applies
/// any number of batches, then calls [`commit`]. A failed [`apply_batch`]
/// leaves the transaction usable and none of the batch's records applied.
///
/// [`begin`]: EntrySink::begin
/// [`commit`]: EntrySink::commit
/// [`apply_batch`]: EntrySink::apply_batch
pub trait EntrySink {
    fn begin(&mut self) -> Result<(), ReplicaError>;

    /// Apply records in order. With `allow_update_on_conflict` an existing
    /// row with the same identity is overwritten; otherwise it is kept.
    fn apply_batch(
        &mut self,
        records: &[StateChangeRecord],
        allow_update_on_conflict: bool,
    ) -> Result<(), ReplicaError>;

    fn commit(&mut self) -> Result<(), ReplicaError>;

    fn rollback(&mut self) -> Result<(), ReplicaError>;
}
