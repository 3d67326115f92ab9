//! Slot tables addressed by small integer handles.
//!
//! Run and chunk metadata lives here rather than inside the memory it
//! describes; extent nodes carry the handle.

use core::marker::PhantomData;

pub(crate) trait TableId: Copy {
  fn from_raw(raw: u32) -> Self;
  fn raw(self) -> u32;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct ChunkId(pub(crate) u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct RunId(pub(crate) u32);

impl TableId for ChunkId {
  fn from_raw(raw: u32) -> Self {
    Self(raw)
  }

  fn raw(self) -> u32 {
    self.0
  }
}

impl TableId for RunId {
  fn from_raw(raw: u32) -> Self {
    Self(raw)
  }

  fn raw(self) -> u32 {
    self.0
  }
}

/// Vacant slots are reused lowest-last (LIFO), so ids stay dense.
pub(super) struct IdTable<I, T> {
  slots: Vec<Option<T>>,
  vacant: Vec<u32>,
  len: usize,
  _id: PhantomData<I>,
}

impl<I: TableId, T> IdTable<I, T> {
  pub(super) const fn new() -> Self {
    Self {
      slots: Vec::new(),
      vacant: Vec::new(),
      len: 0,
      _id: PhantomData,
    }
  }

  pub(super) fn insert(&mut self, value: T) -> I {
    self.len += 1;
    if let Some(raw) = self.vacant.pop() {
      self.slots[raw as usize] = Some(value);
      return I::from_raw(raw);
    }
    let raw = self.slots.len() as u32;
    self.slots.push(Some(value));
    I::from_raw(raw)
  }

  pub(super) fn remove(&mut self, id: I) -> Option<T> {
    let value = self.slots.get_mut(id.raw() as usize)?.take()?;
    self.vacant.push(id.raw());
    self.len -= 1;
    Some(value)
  }

  pub(super) fn get(&self, id: I) -> Option<&T> {
    self.slots.get(id.raw() as usize)?.as_ref()
  }

  pub(super) fn get_mut(&mut self, id: I) -> Option<&mut T> {
    self.slots.get_mut(id.raw() as usize)?.as_mut()
  }

  pub(super) fn len(&self) -> usize {
    self.len
  }

  pub(super) fn values(&self) -> impl Iterator<Item = &T> {
    self.slots.iter().flatten()
  }

  /// Empties the table, yielding every live value.
  pub(super) fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
    self.vacant.clear();
    self.len = 0;
    self.slots.drain(..).flatten()
  }
}
