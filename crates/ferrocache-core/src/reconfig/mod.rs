//! Live protocol reconfiguration
//!
//! Every transaction is stamped with the `(epoch, protocol)` it was admitted
//! under. A switch publishes a new epoch; commands carrying an older one are
//! still honored by the protocol that stamped them.

mod manager;
mod protocol_manager;

pub use manager::{
    ProtocolDescriptor, ReconfigurableReplicationManager, ReconfigurationReport, SwitchHandle,
    SwitchRecord,
};
pub use protocol_manager::{ProtocolManager, ProtocolView, SwitchStatus};
