use std::panic::{self, AssertUnwindSafe};

use tracing::{info, warn};

use crate::{
    destination::{Destination, Origin},
    host::{Host, NodeId},
    route,
    time::UT,
    transfer::{panic_message, Infeasibility, TransferModel, TransferState},
};

/// Every transfer available from one origin.
#[derive(Clone, Debug, Default)]
pub struct AstrogationModel {
    pub origin: Option<Origin>,
    /// Nearest destinations first.
    pub transfers: Vec<TransferModel>,
    /// Bumped whenever the transfers are rebuilt or recalculated.
    pub generation: u64,
    active: Option<Destination>,
}

impl AstrogationModel {
    /// Resolve the destinations reachable from `origin` and calculate
    /// every ejection burn.
    pub fn build<H: Host + ?Sized>(host: &H, origin: Option<Origin>, generation: u64) -> Self {
        let transfers = origin
            .iter()
            .flat_map(|o| {
                route::resolve(host, o).into_iter().map(move |r| {
                    TransferModel::new(o.clone(), r.destination, r.name, r.tier)
                })
            })
            .collect();
        let mut model = Self {
            origin,
            transfers,
            generation,
            active: None,
        };
        model.calculate_ejection_burns(host);
        model.select(host.target());
        info!(
            origin = ?model.origin,
            transfers = model.transfers.len(),
            generation,
            "astrogation model built"
        );
        model
    }

    /// Recalculate every ejection burn in place, keeping links to the
    /// nodes made from them. One transfer failing never stops the others.
    pub fn calculate_ejection_burns<H: Host + ?Sized>(&mut self, host: &H) {
        for transfer in &mut self.transfers {
            let result =
                panic::catch_unwind(AssertUnwindSafe(|| transfer.calculate_ejection_burn(host)));
            if let Err(payload) = result {
                let message = panic_message(&*payload);
                warn!(destination = %transfer.name, %message, "ejection calculation panicked");
                transfer.reset();
                transfer.state = TransferState::Infeasible(Infeasibility::Panicked(message));
            }
        }
    }

    /// Mark the transfer to `destination` as the active one.
    pub fn select(&mut self, destination: Option<Destination>) {
        self.active = destination.filter(|d| self.position(d).is_some());
        for transfer in &mut self.transfers {
            transfer.active = self.active.as_ref() == Some(&transfer.destination);
        }
    }

    pub fn active(&self) -> Option<&TransferModel> {
        self.get(self.active.as_ref()?)
    }

    pub fn position(&self, destination: &Destination) -> Option<usize> {
        self.transfers
            .iter()
            .position(|t| t.destination == *destination)
    }

    pub fn get(&self, destination: &Destination) -> Option<&TransferModel> {
        self.transfers.iter().find(|t| t.destination == *destination)
    }

    pub fn get_mut(&mut self, destination: &Destination) -> Option<&mut TransferModel> {
        self.transfers
            .iter_mut()
            .find(|t| t.destination == *destination)
    }

    /// Host nodes linked to any transfer.
    pub fn linked_nodes(&self) -> Vec<NodeId> {
        self.transfers.iter().flat_map(|t| t.linked_nodes()).collect()
    }

    pub fn relink(&mut self, pairs: &[(NodeId, NodeId)]) {
        if pairs.is_empty() {
            return;
        }
        for transfer in &mut self.transfers {
            transfer.relink(pairs);
        }
    }

    pub fn has_stale_burns(&self, now: UT) -> bool {
        self.transfers.iter().any(|t| t.is_stale(now))
    }

    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }
}
