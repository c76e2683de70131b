//! The kernel object registry: identity, existence counting and
//! IPC-key-based sharing for every kernel object.
//!
//! Objects live in a fixed arena of slots addressed by (index, generation).
//! Liveness is a generation compare: a stale id simply misses, so a handle
//! kept across a concurrent destruction is harmless. One lock covers the
//! slot table, the free list and the IPC key map.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use lv2_rt::{ErrorCode, E_AGAIN, E_EXIST, E_INVAL, E_NOENT};

use crate::util::SpinLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjKind {
    Mutex,
    LwMutex,
    Cond,
    Semaphore,
    Queue,
}

/// Implemented by every type the registry can hold.
pub trait KernelObject: Any + Send + Sync {
    const KIND: ObjKind;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId {
    index: u32,
    generation: u32,
}

impl ObjectId {
    pub fn as_u64(&self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    pub fn from_u64(raw: u64) -> Self {
        Self {
            index: raw as u32,
            generation: (raw >> 32) as u32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pshared {
    No,
    Yes,
}

/// How `create` treats an existing IPC registration for the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcFlags {
    NewlyCreated,
    NotCare,
    NotCreate,
}

impl IpcFlags {
    pub fn from_raw(raw: u32) -> Result<Self, ErrorCode> {
        match raw {
            lv2_rt::SYS_SYNC_NEWLY_CREATED => Ok(Self::NewlyCreated),
            lv2_rt::SYS_SYNC_NOT_CREATE => Ok(Self::NotCreate),
            lv2_rt::SYS_SYNC_NOT_CARE => Ok(Self::NotCare),
            _ => Err(E_INVAL),
        }
    }
}

struct Slot {
    generation: u32,
    exists: u32,
    kind: Option<ObjKind>,
    object: Option<Arc<dyn Any + Send + Sync>>,
}

struct Inner {
    slots: Vec<Slot>,
    free: Vec<u32>,
    ipc: HashMap<u64, ObjectId>,
}

pub struct Registry {
    inner: SpinLock<Inner>,
    ipc_key_required: bool,
}

impl Registry {
    pub fn new(max_objects: usize, ipc_key_required: bool) -> Self {
        assert!(max_objects > 0 && max_objects <= u32::MAX as usize);
        let mut slots = Vec::with_capacity(max_objects);
        for _ in 0..max_objects {
            slots.push(Slot {
                generation: 0,
                exists: 0,
                kind: None,
                object: None,
            });
        }
        // Low indices first.
        let free = (0..max_objects as u32).rev().collect();
        Self {
            inner: SpinLock::new(Inner {
                slots,
                free,
                ipc: HashMap::new(),
            }),
            ipc_key_required,
        }
    }

    /// Creates a kernel object, or attaches to an existing IPC
    /// registration, depending on `pshared`/`flags`. Argument validation
    /// happens before any allocation; a factory failure rolls the slot
    /// and any IPC insertion back, leaving no partial object visible.
    /// Returns the id, the object, and whether it was newly created.
    ///
    /// The construction hook runs under the registry lock, so it must not
    /// call back into the registry.
    pub fn create<T: KernelObject>(
        &self,
        pshared: Pshared,
        ipc_key: u64,
        flags: IpcFlags,
        factory: impl FnOnce(ObjectId) -> Result<Arc<T>, ErrorCode>,
    ) -> Result<(ObjectId, Arc<T>, bool), ErrorCode> {
        match pshared {
            Pshared::No => {
                // Private objects carry no key.
                if ipc_key != 0 {
                    return Err(E_INVAL);
                }
                let mut inner = self.inner.lock();
                let (id, obj) = Self::alloc(&mut inner, factory)?;
                log::debug!("created {:?} id={:x}", T::KIND, id.as_u64());
                Ok((id, obj, true))
            }
            Pshared::Yes => {
                if self.ipc_key_required && ipc_key == 0 {
                    return Err(E_INVAL);
                }
                let mut inner = self.inner.lock();
                if let Some(&id) = inner.ipc.get(&ipc_key) {
                    return match flags {
                        IpcFlags::NewlyCreated => Err(E_EXIST),
                        IpcFlags::NotCare | IpcFlags::NotCreate => {
                            let obj = Self::attach(&mut inner, id)?;
                            log::debug!("attached {:?} id={:x} key={:x}", T::KIND, id.as_u64(), ipc_key);
                            Ok((id, obj, false))
                        }
                    };
                }
                if flags == IpcFlags::NotCreate {
                    return Err(E_NOENT);
                }
                let (id, obj) = Self::alloc(&mut inner, factory)?;
                inner.ipc.insert(ipc_key, id);
                log::debug!("created {:?} id={:x} key={:x}", T::KIND, id.as_u64(), ipc_key);
                Ok((id, obj, true))
            }
        }
    }

    fn alloc<T: KernelObject>(
        inner: &mut Inner,
        factory: impl FnOnce(ObjectId) -> Result<Arc<T>, ErrorCode>,
    ) -> Result<(ObjectId, Arc<T>), ErrorCode> {
        // Table exhaustion is recoverable for the guest.
        let index = inner.free.pop().ok_or(E_AGAIN)?;
        let id = ObjectId {
            index,
            generation: inner.slots[index as usize].generation,
        };
        let obj = match factory(id) {
            Ok(obj) => obj,
            Err(code) => {
                // Roll back: the slot was never made visible.
                inner.free.push(index);
                return Err(code);
            }
        };
        let slot = &mut inner.slots[index as usize];
        slot.exists = 1;
        slot.kind = Some(T::KIND);
        slot.object = Some(obj.clone());
        Ok((id, obj))
    }

    fn attach<T: KernelObject>(inner: &mut Inner, id: ObjectId) -> Result<Arc<T>, ErrorCode> {
        let slot = &mut inner.slots[id.index as usize];
        debug_assert!(slot.generation == id.generation && slot.exists > 0);
        if slot.kind != Some(T::KIND) {
            return Err(E_INVAL);
        }
        let obj = slot
            .object
            .clone()
            .and_then(|any| any.downcast::<T>().ok())
            .ok_or(E_INVAL)?;
        slot.exists += 1;
        Ok(obj)
    }

    /// Drops one existence reference. At zero the object is removed from
    /// the IPC map and the slot is retired (generation bump). Returns
    /// whether this was the last reference.
    pub fn on_id_destroy(&self, id: ObjectId, ipc_key: u64, pshared: Pshared) -> bool {
        let mut inner = self.inner.lock();
        let slot = &mut inner.slots[id.index as usize];
        if slot.generation != id.generation || slot.exists == 0 {
            // Already retired by a concurrent destroy.
            return false;
        }
        slot.exists -= 1;
        if slot.exists > 0 {
            return false;
        }
        slot.object = None;
        slot.kind = None;
        slot.generation = slot.generation.wrapping_add(1);
        inner.free.push(id.index);
        if pshared == Pshared::Yes {
            inner.ipc.remove(&ipc_key);
        }
        log::debug!("destroyed id={:x}", id.as_u64());
        true
    }

    /// Force-retires a slot regardless of its existence count; destroy
    /// paths that tear the object down for every attached handle use
    /// this. Outstanding handles observe a dead object afterwards.
    pub fn remove(&self, id: ObjectId, ipc_key: u64, pshared: Pshared) -> bool {
        let mut inner = self.inner.lock();
        let slot = &mut inner.slots[id.index as usize];
        if slot.generation != id.generation || slot.exists == 0 {
            return false;
        }
        slot.exists = 0;
        slot.object = None;
        slot.kind = None;
        slot.generation = slot.generation.wrapping_add(1);
        inner.free.push(id.index);
        if pshared == Pshared::Yes {
            inner.ipc.remove(&ipc_key);
        }
        log::debug!("removed id={:x}", id.as_u64());
        true
    }

    /// Liveness test tolerant of racy concurrent destruction: a stale id
    /// misses instead of touching freed state.
    pub fn check(&self, id: ObjectId) -> bool {
        let inner = self.inner.lock();
        let slot = &inner.slots[id.index as usize];
        slot.generation == id.generation && slot.exists > 0
    }

    pub fn get<T: KernelObject>(&self, id: ObjectId) -> Option<Arc<T>> {
        let inner = self.inner.lock();
        let slot = &inner.slots[id.index as usize];
        if slot.generation != id.generation || slot.exists == 0 || slot.kind != Some(T::KIND) {
            return None;
        }
        slot.object.clone().and_then(|any| any.downcast::<T>().ok())
    }

    /// Live objects of one kind.
    pub fn count(&self, kind: ObjKind) -> usize {
        let inner = self.inner.lock();
        inner
            .slots
            .iter()
            .filter(|slot| slot.exists > 0 && slot.kind == Some(kind))
            .count()
    }
}
