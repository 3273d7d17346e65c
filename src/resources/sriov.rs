//! SR-IOV virtual function claims and parent card selection.

use crate::error::{Error, Result};
use crate::host::{Host, NetworkCard, VirtualFunction};
use std::collections::BTreeMap;

/// Which VFs are claimed, and by whom.
///
/// Only reachable through [`HostResources::sriov`](super::HostResources::sriov),
/// so every read and claim happens under the global SR-IOV lock.
#[derive(Debug, Default)]
pub struct SriovClaims {
    owners: BTreeMap<(String, u32), String>,
}

/// Selects candidate cards when a NIC has no explicit parent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CardSelector {
    /// PCI address of the physical function.
    pub pci: String,
    /// Vendor ID.
    pub vendor_id: String,
    /// Product ID.
    pub product_id: String,
}

impl CardSelector {
    /// Whether `card` is selected.
    ///
    /// A PCI address match always selects. Otherwise the product ID only
    /// counts together with the vendor ID.
    pub fn matches(&self, card: &NetworkCard) -> bool {
        if !self.pci.is_empty() && card.pci_address == self.pci {
            return true;
        }
        if !self.vendor_id.is_empty() && !self.product_id.is_empty() {
            return card.vendor_id == self.vendor_id && card.product_id == self.product_id;
        }
        !self.vendor_id.is_empty() && card.vendor_id == self.vendor_id
    }
}

impl SriovClaims {
    /// Current owner of a VF.
    pub fn owner(&self, parent: &str, id: u32) -> Option<&str> {
        self.owners
            .get(&(parent.to_string(), id))
            .map(String::as_str)
    }

    /// Claim a VF for `owner`.
    pub fn claim(&mut self, parent: &str, id: u32, owner: &str) -> Result<()> {
        match self.owner(parent, id) {
            Some(current) if current != owner => Err(Error::exhausted(format!(
                "VF {} on {} already claimed by {}",
                id, parent, current
            ))),
            _ => {
                self.owners
                    .insert((parent.to_string(), id), owner.to_string());
                Ok(())
            }
        }
    }

    /// Re-register a claim found in persisted state.
    pub(crate) fn restore(&mut self, parent: &str, id: u32, owner: &str) {
        self.owners
            .insert((parent.to_string(), id), owner.to_string());
    }

    /// Release a VF if `owner` holds it.
    pub fn release(&mut self, parent: &str, id: u32, owner: &str) {
        let key = (parent.to_string(), id);
        if self.owners.get(&key).is_some_and(|o| o == owner) {
            self.owners.remove(&key);
        }
    }

    /// First unclaimed VF on `parent`.
    ///
    /// With `need_interface`, VFs that have no host network interface (for
    /// example ones left bound to `vfio-pci`) are skipped.
    pub fn free_vf(&self, host: &dyn Host, parent: &str, need_interface: bool) -> Result<VirtualFunction> {
        host.virtual_functions(parent)?
            .into_iter()
            .filter(|vf| self.owner(parent, vf.id).is_none())
            .find(|vf| !need_interface || vf.interface.is_some())
            .ok_or_else(|| Error::exhausted(format!("no free virtual functions on {}", parent)))
    }

    /// Free and total VF counts on `parent`.
    pub fn count_free(&self, host: &dyn Host, parent: &str) -> Result<(usize, usize)> {
        let vfs = host.virtual_functions(parent)?;
        let free = vfs
            .iter()
            .filter(|vf| self.owner(parent, vf.id).is_none())
            .count();
        Ok((free, vfs.len()))
    }

    /// Pick the best parent among the selected cards.
    ///
    /// Cards on one of `numa` win over cards on one of `fallback`, which win
    /// over the rest. Within the same tier the card with the highest ratio of
    /// free VFs wins.
    pub fn find_parent(
        &self,
        host: &dyn Host,
        selector: &CardSelector,
        numa: &[u32],
        fallback: &[u32],
    ) -> Result<String> {
        let in_set = |set: &[u32], node: Option<u32>| node.is_some_and(|n| set.contains(&n));

        let mut best: Option<(String, f64, Option<u32>)> = None;

        for card in host.network_cards()? {
            if !selector.matches(&card) {
                continue;
            }

            let (free, total) = match self.count_free(host, &card.interface) {
                Ok(counts) => counts,
                Err(e) => {
                    tracing::debug!(pci = %card.pci_address, error = %e, "skipping card");
                    continue;
                }
            };
            if free == 0 || total == 0 {
                tracing::debug!(pci = %card.pci_address, "no available VFs on card");
                continue;
            }
            let ratio = free as f64 / total as f64;

            let Some((best_ratio, best_numa)) = best.as_ref().map(|(_, r, n)| (*r, *n)) else {
                best = Some((card.interface.clone(), ratio, card.numa_node));
                continue;
            };

            if !numa.is_empty() {
                if !in_set(numa, best_numa) && in_set(numa, card.numa_node) {
                    best = Some((card.interface.clone(), ratio, card.numa_node));
                    continue;
                }
                if in_set(numa, best_numa) && !in_set(numa, card.numa_node) {
                    continue;
                }
                if !in_set(fallback, best_numa) && in_set(fallback, card.numa_node) {
                    best = Some((card.interface.clone(), ratio, card.numa_node));
                    continue;
                }
                if in_set(fallback, best_numa)
                    && !in_set(fallback, card.numa_node)
                    && !in_set(numa, card.numa_node)
                {
                    continue;
                }
            }

            if ratio > best_ratio {
                tracing::debug!(pci = %card.pci_address, parent = %card.interface, "preferring less busy card");
                best = Some((card.interface.clone(), ratio, card.numa_node));
            }
        }

        best.map(|(parent, _, _)| parent)
            .ok_or_else(|| Error::exhausted("couldn't find a matching NIC"))
    }
}
