//! Global-write site role control.
//!
//! Between the two sites of a global-write cluster, role is manual: an
//! administrator promotes or demotes a site through the local-write
//! cluster's administration interface. No automatic arbitration happens;
//! when the peer site appears primary, promotion requires the operator's
//! explicit confirmation.

use crate::roles::GlobalWriteRole;
use helio_core::error::{ClusterKind, Error, Result};
use parking_lot::Mutex;
use tracing::{info, warn};

/// This site's global-write role.
pub struct GlobalWriteState {
    role: Mutex<GlobalWriteRole>,
}

impl GlobalWriteState {
    /// Start with `initial` (from configuration or the system database).
    pub fn new(initial: GlobalWriteRole) -> Self {
        GlobalWriteState {
            role: Mutex::new(initial),
        }
    }

    /// Current role.
    pub fn role(&self) -> GlobalWriteRole {
        *self.role.lock()
    }

    /// Bootstrap-time role assignment, before the admin surface takes
    /// over.
    pub fn set_initial_role(&self, role: GlobalWriteRole) {
        *self.role.lock() = role;
    }

    /// Promote this site to PrimarySite.
    ///
    /// `peer_role` is the peer site's role as probed right now (`None`
    /// when unreachable; an unreachable peer is exactly the failover
    /// case, so it does not block promotion). A peer that appears primary
    /// fails the request with `SplitBrainRisk` unless the operator
    /// `confirmed` it.
    pub fn become_primary(
        &self,
        peer_role: Option<GlobalWriteRole>,
        confirmed: bool,
    ) -> Result<()> {
        let mut role = self.role.lock();
        if *role == GlobalWriteRole::None {
            return Err(Error::Cluster(ClusterKind::NotInGlobalWriteCluster));
        }
        if peer_role == Some(GlobalWriteRole::PrimarySite) && !confirmed {
            warn!("peer site appears primary; refusing promotion without confirmation");
            return Err(Error::Cluster(ClusterKind::SplitBrainRisk));
        }
        *role = GlobalWriteRole::PrimarySite;
        info!("site promoted to primary");
        Ok(())
    }

    /// Demote this site to StandbySite.
    pub fn become_standby(&self) -> Result<()> {
        let mut role = self.role.lock();
        if *role == GlobalWriteRole::None {
            return Err(Error::Cluster(ClusterKind::NotInGlobalWriteCluster));
        }
        *role = GlobalWriteRole::StandbySite;
        info!("site demoted to standby");
        Ok(())
    }
}
