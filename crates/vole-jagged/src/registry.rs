use std::any::Any;
use std::collections::HashMap;
use std::sync::{Mutex, Weak};

use once_cell::sync::Lazy;

use vole_core::{Backend, Tensor, TensorId};

use crate::symbol::RaggedSym;

// Ragged-dimension registry
//
// Maps an offsets buffer — by identity, not content — to the symbol minted
// for it, so that every nested tensor built over the same offsets buffer
// carries the same ragged symbol and shape compatibility can be decided by
// token identity alone.
//
// The key is the buffer's TensorId (shared by all clones of one
// allocation); each entry also holds a type-erased Weak handle to the
// allocation so the table observes liveness without extending it. Dead
// entries are purged on every registry call.
//
// One mutex guards both the map and the mint counter: concurrent resolves
// for different buffers cannot tear the counter, and concurrent resolves
// for the same buffer mint at most one symbol.

struct Entry {
    alive: Weak<dyn Any + Send + Sync>,
    sym: RaggedSym,
}

struct Inner {
    entries: HashMap<TensorId, Entry>,
    next_id: u64,
}

impl Inner {
    fn purge(&mut self) {
        self.entries.retain(|_, e| e.alive.strong_count() > 0);
    }
}

/// The resolve-or-mint table behind ragged symbols.
pub struct RaggedRegistry {
    inner: Mutex<Inner>,
}

impl RaggedRegistry {
    fn new() -> Self {
        RaggedRegistry {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                next_id: 0,
            }),
        }
    }

    /// The symbol for an offsets buffer, minting a fresh one on first sight.
    ///
    /// On a hit the stored symbol is returned unchanged; the coefficient
    /// argument only applies to a fresh mint.
    pub fn resolve<B: Backend>(&self, offsets: &Tensor<B>, coeff: usize) -> RaggedSym {
        let mut inner = self.inner.lock().expect("ragged registry poisoned");
        inner.purge();
        if let Some(entry) = inner.entries.get(&offsets.id()) {
            return entry.sym;
        }
        let sym = RaggedSym::new(inner.next_id, coeff);
        inner.next_id += 1;
        inner.entries.insert(
            offsets.id(),
            Entry {
                alive: offsets.weak_handle(),
                sym,
            },
        );
        sym
    }

    /// Seed a pre-existing symbol for an offsets buffer.
    ///
    /// Used by unflatten to carry a symbol across the serialization
    /// boundary instead of minting a duplicate. The first association for a
    /// buffer wins; later calls are no-ops.
    pub fn associate<B: Backend>(&self, offsets: &Tensor<B>, sym: RaggedSym) {
        let mut inner = self.inner.lock().expect("ragged registry poisoned");
        inner.purge();
        inner.entries.entry(offsets.id()).or_insert(Entry {
            alive: offsets.weak_handle(),
            sym,
        });
    }

    /// Whether this offsets buffer already has a symbol.
    pub fn contains<B: Backend>(&self, offsets: &Tensor<B>) -> bool {
        self.contains_id(offsets.id())
    }

    /// Whether a live entry exists for the given buffer id.
    pub fn contains_id(&self, id: TensorId) -> bool {
        let mut inner = self.inner.lock().expect("ragged registry poisoned");
        inner.purge();
        inner.entries.contains_key(&id)
    }
}

static REGISTRY: Lazy<RaggedRegistry> = Lazy::new(RaggedRegistry::new);

/// The process-wide ragged-dimension registry.
pub fn registry() -> &'static RaggedRegistry {
    &REGISTRY
}
