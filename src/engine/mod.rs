//! Lock Queue Engine.
//!
//! The grant, convert and release algorithms over one [`Resource`]. Every
//! function here runs under the caller's per-resource mutex and only touches
//! the resource it is handed; notifications are returned to the caller as a
//! [`QueueReport`] rather than sent from here.
//!
//! # Ordering
//!
//! - A conversion is granted immediately when the requested mode is
//!   compatible with every other holder's granted mode and with both the
//!   held and requested mode of every entry already converting. Otherwise it
//!   goes to the tail of `converting`.
//! - A new lock is granted immediately only if, additionally, nothing on
//!   `blocked` would conflict with it; otherwise it goes to the tail of
//!   `blocked`.
//! - [`process_queue`] only ever promotes the head of a queue. The first
//!   entry that is still incompatible stops the walk, so a later compatible
//!   request never overtakes an earlier one.
//! - Conversions to a weaker mode are granted on the spot. Compatibility is
//!   monotone in mode order, so this can never conflict with anyone, and
//!   queueing it behind the up-conversion it is blocking would deadlock.

mod queue;


pub use queue::{
    BlockingNotice, QueueReport, Transition, acquire, cancel, insert_recovered, process_queue,
    purge_node, release, try_convert,
};
