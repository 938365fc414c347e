//! Remote CRM adapter for Pipesync
//!
//! Implements the [`pipesync_core::ports::remote_crm::IRemoteCrm`] port over
//! the CRM's HTTP API:
//!
//! - [`client`]: thin reqwest wrapper speaking the wire protocol
//! - [`budget`]: fixed-window call-rate budget every request passes through
//! - [`provider`]: the port implementation tying the two together

pub mod budget;
pub mod client;
pub mod provider;

pub use budget::{BudgetError, RateBudget};
pub use client::{CrmHttpClient, RemoteError};
pub use provider::CrmProvider;
