//! Process-wide tables that make host values reachable from generated code.
//!
//! Every stored type `T` gets its own table. A value is identified by a
//! small integer [`Handle`], which emitted code pushes as a constant and
//! passes to the table's fetch function. Handles are handed out in strictly
//! increasing order and are never recycled: a released slot stays allocated,
//! so a stale handle can never alias a newer value.
use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError, RwLock};

use once_cell::sync::Lazy;

use crate::il::value::{IntoValue, Value, ValueType};
use crate::il::{NativeFn, NativeState};
use crate::vm::VmError;

const INITIAL_CAPACITY: usize = 4;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Handle(u32);

impl Handle {
    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn from_index(index: usize) -> Option<Handle> {
        u32::try_from(index).ok().map(Handle)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Values that can be bound into generated code
pub trait Reference: Clone + Send + Sync + IntoValue + 'static {}

impl<T: Clone + Send + Sync + IntoValue + 'static> Reference for T {}

pub struct ReferenceStore<T> {
    // Released slots hold `None`.
    slots: RwLock<Vec<Option<T>>>,
}

static STORES: Lazy<Mutex<HashMap<TypeId, &'static (dyn Any + Send + Sync)>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

impl<T: Clone + Send + Sync + 'static> ReferenceStore<T> {
    pub fn new() -> Self {
        ReferenceStore {
            slots: RwLock::new(Vec::with_capacity(INITIAL_CAPACITY)),
        }
    }

    /// The table for `T` shared by the whole process. It is created on
    /// first use and never torn down.
    pub fn global() -> &'static Self {
        let mut stores = STORES.lock().unwrap_or_else(PoisonError::into_inner);
        let store = *stores.entry(TypeId::of::<T>()).or_insert_with(|| {
            let store: &'static (dyn Any + Send + Sync) = Box::leak(Box::new(Self::new()));
            store
        });
        store
            .downcast_ref::<Self>()
            .expect("reference store registered under a foreign type id")
    }

    pub fn store(&self, value: T) -> Handle {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        if slots.len() == slots.capacity() {
            let additional = slots.capacity().max(INITIAL_CAPACITY);
            slots.reserve_exact(additional);
        }
        let handle = Handle::from_index(slots.len()).expect("reference handles exhausted");
        slots.push(Some(value));
        handle
    }

    /// Panics if `handle` was never issued by this table or has been
    /// released.
    pub fn fetch(&self, handle: Handle) -> T {
        match self.try_fetch(handle) {
            Some(value) => value,
            None => panic!(
                "fetch of invalid handle {} from reference store for {}",
                handle,
                type_name::<T>()
            ),
        }
    }

    pub fn try_fetch(&self, handle: Handle) -> Option<T> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        slots.get(handle.index()).and_then(Clone::clone)
    }

    /// Drop the value behind `handle`. The slot itself stays allocated.
    pub fn release(&self, handle: Handle) {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = slots.get_mut(handle.index()) {
            *slot = None;
        }
    }

    /// Number of handles issued so far, released ones included.
    pub fn len(&self) -> usize {
        self.slots.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone + Send + Sync + 'static> Default for ReferenceStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// The native function that generated code calls to load a value of type `T`
/// from the global table; it takes the handle as its only argument. The
/// table is resolved here, once, so executing the fetch never touches the
/// registry.
pub fn fetch_native<T: Reference>() -> NativeFn {
    NativeFn {
        name: "fetch",
        owner: type_name::<T>(),
        params: &[ValueType::Int],
        ret: T::TYPE,
        state: ReferenceStore::<T>::global(),
        func: fetch_value::<T>,
    }
}

fn fetch_value<T: Reference>(state: NativeState, args: Vec<Value>) -> Result<Value, VmError> {
    let store = match state.downcast_ref::<ReferenceStore<T>>() {
        Some(store) => store,
        None => unreachable!("fetch for {} bound to a foreign table", type_name::<T>()),
    };
    let index = match args.first() {
        Some(Value::Int(n)) => *n,
        Some(other) => return Err(other.mismatch(ValueType::Int)),
        None => return Err(VmError::StackUnderflow),
    };
    let handle = usize::try_from(index)
        .ok()
        .and_then(Handle::from_index)
        .ok_or(VmError::IntOutOfRange {
            value: index,
            target: "handle",
        })?;
    store
        .try_fetch(handle)
        .map(IntoValue::into_value)
        .ok_or(VmError::InvalidHandle(handle))
}
