//! SSH access to scheduled workload instances.
//!
//! Two cooperating servers live in this crate:
//! - `ssh-proxy`: the public entry point. It authenticates clients against the
//!   placement and authorization services, dials the instance's daemon and relays
//!   every channel and global request between the two connections.
//! - `sshd`: the per-instance daemon. It turns session channels into local
//!   processes (optionally on a pty) and serves TCP forwarding.

pub mod authenticator;
pub mod authorization;
pub mod config;
pub mod daemon;
pub mod identity;
pub mod keys;
pub mod logging;
pub mod placement;
pub mod proxy;
pub mod shutdown;

#[cfg(test)]
pub(crate) mod testing;
