// Mutation tracking.
//
// Every structure instance and container owns one `ChangeLedger`. Ledgers
// live in a `ChangeTree` arena keyed by `RefId`; parent, owner and root links
// are plain handles into that arena, never owning pointers.
//
// # Modules
//
// - `operation` — Operation tags and their wire bytes
// - `ledger`    — Per-instance pending operations and linkage
// - `tree`      — Arena of ledgers, dirty-set aggregation per root

pub mod ledger;
pub mod operation;
pub mod tree;

pub use ledger::{ChangeLedger, Flushed, RefId};
pub use operation::{END_OF_STRUCTURE, Operation};
pub use tree::ChangeTree;
