use log::{info, warn};

use crate::{
    config::keys,
    params::ParameterSet,
    runtime::RuntimeState,
    store::{save_parameters, ParameterStore},
    types::SourceChannel,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Idle,
    Saved,
    Failed,
}

/// Coalesces runtime changes that must reach persisted storage into one
/// write per service tick.
#[derive(Debug, Default)]
pub struct SaveScheduler {
    pending: bool,
}

fn source_key(channel: SourceChannel) -> &'static str {
    match channel {
        SourceChannel::Temperature => keys::SOURCE,
        SourceChannel::Pressure => keys::SOURCE_PRESSURE,
        SourceChannel::Humidity => keys::SOURCE_HUMIDITY,
    }
}

/// Copies the runtime source addresses into their parameter buffers.
pub fn write_back_sources(runtime: &RuntimeState, params: &mut ParameterSet) {
    for channel in SourceChannel::ALL {
        let address = runtime.source_address(channel).to_string();
        if let Some(param) = params.get_mut(source_key(channel)) {
            param.set_value(&address);
        }
    }
}

impl SaveScheduler {
    pub fn request(&mut self) {
        self.pending = true;
    }

    /// Drops the request after the set was persisted by another path.
    pub fn clear(&mut self) {
        self.pending = false;
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Writes the bus-negotiated source addresses back into their buffers and
    /// persists the whole set. The request stays pending when the store
    /// fails, so the next tick retries.
    pub fn flush(
        &mut self,
        runtime: &RuntimeState,
        params: &mut ParameterSet,
        store: &mut dyn ParameterStore,
    ) -> FlushOutcome {
        if !self.pending {
            return FlushOutcome::Idle;
        }

        write_back_sources(runtime, params);

        match save_parameters(store, params) {
            Ok(()) => {
                self.pending = false;
                info!(
                    "persisted parameters (sources {}/{}/{})",
                    runtime.source, runtime.source_pressure, runtime.source_humidity
                );
                FlushOutcome::Saved
            }
            Err(err) => {
                warn!("failed to persist parameters, retrying next tick: {err}");
                FlushOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::node_parameters, store::MemoryStore, translate::translate};
    use pretty_assertions::assert_eq;

    #[test]
    fn flush_without_request_does_not_write() {
        let mut params = node_parameters().unwrap();
        let runtime = translate(&params);
        let mut store = MemoryStore::default();
        let mut scheduler = SaveScheduler::default();

        assert_eq!(
            scheduler.flush(&runtime, &mut params, &mut store),
            FlushOutcome::Idle
        );
        assert_eq!(store.saves, 0);
    }

    #[test]
    fn flush_writes_sources_back_and_clears() {
        let mut params = node_parameters().unwrap();
        let mut runtime = translate(&params);
        let mut store = MemoryStore::default();
        let mut scheduler = SaveScheduler::default();

        runtime.set_source_address(SourceChannel::Temperature, 35);
        runtime.set_source_address(SourceChannel::Humidity, 36);
        scheduler.request();
        scheduler.request();

        assert_eq!(
            scheduler.flush(&runtime, &mut params, &mut store),
            FlushOutcome::Saved
        );
        assert!(!scheduler.is_pending());
        assert_eq!(store.saves, 1);
        assert_eq!(params.value(keys::SOURCE), "35");
        assert_eq!(params.value(keys::SOURCE_PRESSURE), "23");
        assert_eq!(params.value(keys::SOURCE_HUMIDITY), "36");

        let stored = store.stored.unwrap();
        assert_eq!(stored.values[keys::SOURCE], "35");

        assert_eq!(
            scheduler.flush(&runtime, &mut params, &mut MemoryStore::default()),
            FlushOutcome::Idle
        );
    }

    #[test]
    fn flush_failure_keeps_request_pending() {
        let mut params = node_parameters().unwrap();
        let runtime = translate(&params);
        let mut store = MemoryStore {
            fail_saves: true,
            ..Default::default()
        };
        let mut scheduler = SaveScheduler::default();
        scheduler.request();

        assert_eq!(
            scheduler.flush(&runtime, &mut params, &mut store),
            FlushOutcome::Failed
        );
        assert!(scheduler.is_pending());

        store.fail_saves = false;
        assert_eq!(
            scheduler.flush(&runtime, &mut params, &mut store),
            FlushOutcome::Saved
        );
        assert!(!scheduler.is_pending());
        assert_eq!(store.saves, 1);
    }
}
