//! Address-set store: idempotent create, flush, and repopulate
//!
//! Four sets are maintained, a host set and a range set per family. Every run
//! flushes before populating, so membership after population is exactly the
//! allowlist of that run.

use crate::core::address::{AddressSet, Allowlist, FamilySets};
use crate::core::error::{Error, Result};
use crate::core::firewall::Family;
use crate::core::state::FirewallState;
use ipnetwork::IpNetwork;
use tracing::{debug, info};

/// Set operations over an injected [`FirewallState`]
pub struct AddressSetStore<'a> {
    state: &'a dyn FirewallState,
}

impl<'a> AddressSetStore<'a> {
    pub fn new(state: &'a dyn FirewallState) -> Self {
        Self { state }
    }

    /// Creates `set` if absent.
    pub async fn ensure(&self, set: &AddressSet) -> Result<()> {
        debug!("Ensuring set {set}");
        self.state.ensure_set(set).await
    }

    pub async fn flush(&self, set: &AddressSet) -> Result<()> {
        debug!("Flushing set {set}");
        self.state.flush_set(set).await
    }

    /// Inserts one element; duplicates are a no-op.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` if the element does not fit the set's
    /// family or kind.
    pub async fn add(&self, set: &AddressSet, element: IpNetwork) -> Result<()> {
        check_element(set, &element)?;
        self.state.add_element(set, element).await
    }

    /// Ensure, flush, then add every element in one batch.
    pub async fn replace(&self, set: &AddressSet, elements: &[IpNetwork]) -> Result<()> {
        for element in elements {
            check_element(set, element)?;
        }
        self.ensure(set).await?;
        self.flush(set).await?;
        if !elements.is_empty() {
            self.state.add_elements(set, elements).await?;
        }
        info!("{}: {} entries", set.name, elements.len());
        Ok(())
    }

    /// Repopulates both sets of `family` from the allowlist.
    pub async fn populate(
        &self,
        sets: &FamilySets,
        allowlist: &Allowlist,
        family: Family,
    ) -> Result<()> {
        self.replace(&sets.hosts, &allowlist.hosts(family)).await?;
        self.replace(&sets.nets, &allowlist.nets(family)).await
    }
}

fn check_element(set: &AddressSet, element: &IpNetwork) -> Result<()> {
    if set.accepts(element) {
        Ok(())
    } else {
        Err(Error::validation(
            set.name.clone(),
            format!("{element} does not belong in {set}"),
        ))
    }
}
