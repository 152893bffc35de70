//! Lock-free skip-list priority queue with epoch-based reclamation.

pub mod ebr;
pub mod mark;
pub mod pq;
