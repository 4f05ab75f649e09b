//! Keeping the transfer model current: ejection burns on the
//! simulation thread, plane changes on one background worker.
//!
//! The worker owns no model state. It receives a job through a
//! work slot that holds at most one job, leases the host for one
//! transfer at a time, and sends each result back over a channel.
//! [`Loader::tick`] applies results on the simulation thread, and only
//! if they belong to the current generation.
//!
//! While measuring, the worker takes the model's own nodes off the
//! vessel and puts them back under new ids. The ids it knows about live
//! in a scratch list behind their own lock: the worker holds it for one
//! transfer at a time, and the simulation thread holds it whenever it
//! touches nodes, so the two never edit the vessel's nodes at once.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        mpsc::{self, Receiver, Sender},
        Arc,
    },
    thread::{self, JoinHandle},
};

use color_eyre::eyre::{self, OptionExt};
use nalgebra::Vector3;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, trace, warn};

use crate::{
    config::Settings,
    destination::{Destination, Origin},
    host::{Host, LockedHost, NodeId},
    model::AstrogationModel,
    transfer::{BurnKind, PlaneChangeResult, SkipReason, TransferModel, TransferState},
    watch::{Change, Watcher},
};

/// Fired on the simulation thread from [`Loader::tick`] and
/// [`Loader::start`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LoadEvent {
    /// The transfer list was rebuilt or every ejection recalculated.
    DestinationsChanged,
    /// A plane change result was applied to this transfer.
    TransferUpdated(usize),
    /// Every transfer of the current generation is done.
    Finished,
}

type Listener = Box<dyn FnMut(&AstrogationModel, &LoadEvent)>;

struct Job {
    generation: u64,
    transfers: VecDeque<(usize, TransferModel)>,
}

#[derive(Default)]
struct Slot {
    job: Option<Job>,
    shutdown: bool,
}

struct Shared {
    slot: Mutex<Slot>,
    wake: Condvar,
    generation: AtomicU64,
    displays: AtomicUsize,
    /// Nodes the model is linked to, as the host currently knows them.
    scratch: Mutex<Vec<NodeId>>,
}

enum Completion {
    Transfer {
        generation: u64,
        index: usize,
        result: PlaneChangeResult,
        /// Model nodes the worker recreated, as `(old, new)`.
        relinked: Vec<(NodeId, NodeId)>,
    },
    Finished {
        generation: u64,
    },
}

pub struct Loader<H: Host + Send + 'static> {
    host: Arc<Mutex<H>>,
    settings: Arc<Settings>,
    shared: Arc<Shared>,
    model: AstrogationModel,
    watcher: Watcher,
    completions: Receiver<Completion>,
    listeners: Vec<Listener>,
    busy: bool,
    worker: Option<JoinHandle<()>>,
}

impl<H: Host + Send + 'static> Loader<H> {
    pub fn new(host: Arc<Mutex<H>>, settings: Arc<Settings>) -> eyre::Result<Self> {
        let shared = Arc::new(Shared {
            slot: Mutex::new(Slot::default()),
            wake: Condvar::new(),
            generation: AtomicU64::new(0),
            displays: AtomicUsize::new(0),
            scratch: Mutex::new(Vec::new()),
        });
        let (tx, rx) = mpsc::channel();
        let worker = {
            let host = host.clone();
            let settings = settings.clone();
            let shared = shared.clone();
            thread::Builder::new()
                .name("astrogator-loader".into())
                .spawn(move || worker_thread(&host, &settings, &shared, &tx))?
        };
        Ok(Self {
            host,
            settings,
            shared,
            model: AstrogationModel::default(),
            watcher: Watcher::new(),
            completions: rx,
            listeners: Vec::new(),
            busy: false,
            worker: Some(worker),
        })
    }

    pub fn model(&self) -> &AstrogationModel {
        &self.model
    }

    pub fn host(&self) -> &Arc<Mutex<H>> {
        &self.host
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// No plane change work is outstanding.
    pub fn is_idle(&self) -> bool {
        !self.busy
    }

    pub fn subscribe(&mut self, listener: impl FnMut(&AstrogationModel, &LoadEvent) + 'static) {
        self.listeners.push(Box::new(listener));
    }

    pub fn notify_display_opened(&self) {
        self.shared.displays.fetch_add(1, Ordering::AcqRel);
        let _slot = self.shared.slot.lock();
        self.shared.wake.notify_all();
    }

    pub fn notify_display_closed(&self) {
        let _ = self
            .shared
            .displays
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Rebuild the model for `origin`, superseding any run in flight.
    pub fn start(&mut self, origin: Option<Origin>) {
        let generation = self.supersede();
        info!(?origin, generation, "starting astrogation");
        let shared = Arc::clone(&self.shared);
        let mut scratch = shared.scratch.lock();
        self.model.generation = generation;
        self.drain();
        self.model = {
            let host = self.host.lock();
            AstrogationModel::build(&*host, origin, generation)
        };
        *scratch = self.model.linked_nodes();
        drop(scratch);
        self.fire(LoadEvent::DestinationsChanged);
        self.post();
    }

    /// Recalculate every transfer of the current model in place.
    pub fn recalculate(&mut self) {
        let generation = self.supersede();
        debug!(generation, "recalculating transfers");
        let shared = Arc::clone(&self.shared);
        let mut scratch = shared.scratch.lock();
        self.model.generation = generation;
        self.drain();
        self.model.calculate_ejection_burns(&*self.host.lock());
        *scratch = self.model.linked_nodes();
        drop(scratch);
        self.fire(LoadEvent::DestinationsChanged);
        self.post();
    }

    /// Simulation-thread heartbeat: react to host changes, refresh
    /// stale burns, apply finished plane changes and keep linked nodes
    /// in sync.
    pub fn tick(&mut self) {
        let (change, stale, origin, target) = {
            let host = self.host.lock();
            let change = self.watcher.poll(&*host);
            (
                change,
                self.model.has_stale_burns(host.universal_time()),
                Watcher::origin(&*host),
                host.target(),
            )
        };
        match change {
            Some(Change::Origin | Change::Situation) => self.start(origin),
            Some(Change::Target) => match target {
                Some(t) if self.model.position(&t).is_none() => self.start(origin),
                t => {
                    self.model.select(t);
                    self.fire(LoadEvent::DestinationsChanged);
                }
            },
            Some(Change::Orbit) => self.recalculate(),
            None if stale => self.recalculate(),
            None => {}
        }

        let shared = Arc::clone(&self.shared);
        let Some(mut scratch) = shared.scratch.try_lock() else {
            // the worker is measuring; nodes wait for the next tick
            self.drain();
            return;
        };
        self.drain();
        let mut host = self.host.lock();
        for transfer in &mut self.model.transfers {
            if let Err(error) = transfer.update_maneuvers(&mut *host) {
                warn!(destination = %transfer.name, %error, "failed to update maneuver nodes");
            }
        }
        *scratch = self.model.linked_nodes();
    }

    /// Replace the vessel's nodes with the burns of the transfer to
    /// `destination`.
    pub fn create_maneuvers(&mut self, destination: &Destination) -> eyre::Result<()> {
        self.with_nodes(|model, host, _| {
            model
                .get_mut(destination)
                .ok_or_eyre("no transfer to that destination")?
                .create_maneuvers(host)
        })
    }

    /// Warp to shortly before the ejection burn. Waits for the worker,
    /// which must not see time jump under its transient nodes.
    pub fn warp_to_ejection(&mut self, destination: &Destination) -> eyre::Result<()> {
        self.with_nodes(|model, host, settings| {
            model
                .get(destination)
                .ok_or_eyre("no transfer to that destination")?
                .warp_to_ejection(host, settings)
        })
    }

    /// Nudge one of a transfer's burns; see [`crate::burn::Burn::adjust`].
    pub fn adjust(
        &mut self,
        destination: &Destination,
        kind: BurnKind,
        direction: Vector3<f64>,
        fraction: f64,
    ) -> eyre::Result<bool> {
        self.with_nodes(|model, host, _| {
            model
                .get_mut(destination)
                .and_then(|t| t.burn_mut(kind))
                .ok_or_eyre("no such burn")?
                .adjust(host, direction, fraction)
        })
    }

    /// Run `op` on the vessel's nodes once the worker is between
    /// transfers, with every node it recreated already relinked.
    fn with_nodes<T>(
        &mut self,
        op: impl FnOnce(&mut AstrogationModel, &mut H, &Settings) -> eyre::Result<T>,
    ) -> eyre::Result<T> {
        let shared = Arc::clone(&self.shared);
        let mut scratch = shared.scratch.lock();
        self.drain();
        let result = op(&mut self.model, &mut *self.host.lock(), &self.settings);
        *scratch = self.model.linked_nodes();
        result
    }

    /// Apply everything the worker has sent. Relinks apply whatever
    /// their generation; results only for the current one.
    fn drain(&mut self) {
        while let Ok(completion) = self.completions.try_recv() {
            match completion {
                Completion::Transfer {
                    generation,
                    index,
                    result,
                    relinked,
                } => {
                    self.model.relink(&relinked);
                    if generation != self.model.generation {
                        trace!(generation, "dropping result of a superseded run");
                        continue;
                    }
                    let Some(transfer) = self.model.transfers.get_mut(index) else {
                        continue;
                    };
                    transfer.absorb_plane_change(result);
                    self.fire(LoadEvent::TransferUpdated(index));
                }
                Completion::Finished { generation } if generation == self.model.generation => {
                    self.busy = false;
                    info!(generation, "plane changes finished");
                    self.fire(LoadEvent::Finished);
                }
                Completion::Finished { generation } => {
                    trace!(generation, "dropping end of a superseded run");
                }
            }
        }
    }

    /// Invalidate everything in flight and return the new generation.
    fn supersede(&mut self) -> u64 {
        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.shared.slot.lock().job = None;
        generation
    }

    fn post(&mut self) {
        let generation = self.model.generation;
        if !self.settings.generate_plane_change_burns {
            for transfer in &mut self.model.transfers {
                if transfer.ejection.is_some() {
                    transfer.state = TransferState::PlaneChangeSkipped(SkipReason::Disabled);
                }
            }
            self.busy = false;
            self.fire(LoadEvent::Finished);
            return;
        }

        let transfers: VecDeque<_> = self
            .model
            .transfers
            .iter()
            .enumerate()
            .filter(|(_, t)| t.ejection.is_some())
            .map(|(i, t)| (i, t.clone()))
            .collect();
        if transfers.is_empty() {
            self.busy = false;
            self.fire(LoadEvent::Finished);
            return;
        }
        debug!(generation, count = transfers.len(), "queueing plane changes");
        self.busy = true;
        let mut slot = self.shared.slot.lock();
        slot.job = Some(Job {
            generation,
            transfers,
        });
        self.shared.wake.notify_all();
    }

    fn fire(&mut self, event: LoadEvent) {
        for listener in &mut self.listeners {
            listener(&self.model, &event);
        }
    }
}

impl<H: Host + Send + 'static> Drop for Loader<H> {
    fn drop(&mut self) {
        self.shared.generation.fetch_add(1, Ordering::AcqRel);
        {
            let mut slot = self.shared.slot.lock();
            slot.shutdown = true;
            slot.job = None;
            self.shared.wake.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("astrogation worker panicked");
            }
        }
    }
}

fn worker_thread<H: Host>(
    host: &Mutex<H>,
    settings: &Settings,
    shared: &Shared,
    tx: &Sender<Completion>,
) {
    loop {
        let mut job = {
            let mut slot = shared.slot.lock();
            loop {
                if slot.shutdown {
                    return;
                }
                if slot.job.is_some() && shared.displays.load(Ordering::Acquire) > 0 {
                    break;
                }
                shared.wake.wait(&mut slot);
            }
            match slot.job.take() {
                Some(job) => job,
                None => continue,
            }
        };
        debug!(generation = job.generation, "plane change run started");

        while let Some((index, mut transfer)) = job.transfers.pop_front() {
            if shared.generation.load(Ordering::Acquire) != job.generation {
                debug!(generation = job.generation, "plane change run superseded");
                break;
            }
            if shared.displays.load(Ordering::Acquire) == 0 {
                // nobody is looking; park the rest until a display opens
                job.transfers.push_front((index, transfer));
                let mut slot = shared.slot.lock();
                if slot.job.is_none() && shared.generation.load(Ordering::Acquire) == job.generation {
                    debug!(remaining = job.transfers.len(), "parking plane change run");
                    slot.job = Some(job);
                }
                break;
            }

            let mut scratch = shared.scratch.lock();
            if shared.generation.load(Ordering::Acquire) != job.generation {
                debug!(generation = job.generation, "plane change run superseded");
                break;
            }
            let relinked = {
                let mut lease = LockedHost::new(
                    host.lock(),
                    settings.plane_change.settle(),
                    &shared.generation,
                    job.generation,
                );
                transfer.calculate_plane_change_burn_with(&mut lease, settings, &scratch)
            };
            for id in scratch.iter_mut() {
                if let Some(&(_, new)) = relinked.iter().find(|(old, _)| old == id) {
                    *id = new;
                }
            }
            trace!(index, state = %transfer.state, "plane change done");
            let completion = Completion::Transfer {
                generation: job.generation,
                index,
                result: transfer.plane_change_result(),
                relinked,
            };
            // the next holder of the scratch list must find the relinks queued
            if tx.send(completion).is_err() {
                return;
            }
            drop(scratch);
            if job.transfers.is_empty()
                && tx
                    .send(Completion::Finished {
                        generation: job.generation,
                    })
                    .is_err()
            {
                return;
            }
        }
    }
}
