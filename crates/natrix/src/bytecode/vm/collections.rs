//! Container construction, unpacking, and subscripting handlers.

use indexmap::IndexMap;

use crate::{
    exception::{ExcType, RunError, RunResult, SimpleException},
    heap::HeapData,
    io::PrintWriter,
    value::{self, Value, hash_key},
};

use super::Vm;

impl<P: PrintWriter> Vm<'_, P> {
    pub(super) fn build_tuple(&mut self, count: u32) -> RunResult<()> {
        let items = self.pop_n(count as usize)?;
        let id = self.heap.allocate(HeapData::Tuple(items));
        self.push(Value::Ref(id));
        Ok(())
    }

    pub(super) fn build_list(&mut self, count: u32) -> RunResult<()> {
        let items = self.pop_n(count as usize)?;
        let id = self.heap.allocate(HeapData::List(items));
        self.push(Value::Ref(id));
        Ok(())
    }

    pub(super) fn build_set(&mut self, count: u32) -> RunResult<()> {
        let items = self.pop_n(count as usize)?;
        let mut entries = IndexMap::with_capacity(items.len());
        for item in items {
            let key = hash_key(&item, self.heap)?;
            entries.entry(key).or_insert(item);
        }
        let id = self.heap.allocate(HeapData::Set(entries));
        self.push(Value::Ref(id));
        Ok(())
    }

    /// Pushes an empty dict pre-sized for `count` entries; the compiler
    /// follows with one `STORE_MAP` per pair.
    pub(super) fn build_map(&mut self, count: u32) -> RunResult<()> {
        let id = self.heap.allocate(HeapData::Dict(IndexMap::with_capacity(count as usize)));
        self.push(Value::Ref(id));
        Ok(())
    }

    /// Stores a key/value pair into the dict below them, leaving the dict
    /// on the stack.
    pub(super) fn store_map(&mut self) -> RunResult<()> {
        let key = self.pop()?;
        let value = self.pop()?;
        let dict = self.top()?;
        let Value::Ref(id) = dict else {
            return Err(RunError::internal("STORE_MAP target is not a dict"));
        };
        let hashed = hash_key(&key, self.heap)?;
        match self.heap.get_mut(id) {
            HeapData::Dict(entries) => {
                entries.insert(hashed, (key, value));
                Ok(())
            }
            _ => Err(RunError::internal("STORE_MAP target is not a dict")),
        }
    }

    pub(super) fn build_slice(&mut self, argc: u32) -> RunResult<()> {
        let step = match argc {
            2 => Value::None,
            3 => self.pop()?,
            _ => return Err(RunError::internal("bad BUILD_SLICE argument")),
        };
        let stop = self.pop()?;
        let start = self.pop()?;
        let id = self.heap.allocate(HeapData::Slice { start, stop, step });
        self.push(Value::Ref(id));
        Ok(())
    }

    /// Unpacks a sequence into `count` values, pushed right-to-left so the
    /// first element ends up on top.
    pub(super) fn unpack_sequence(&mut self, count: u32) -> RunResult<()> {
        let seq = self.pop()?;
        let items = match seq {
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Tuple(items) | HeapData::List(items) => items.clone(),
                _ => {
                    return Err(ExcType::type_error(format!(
                        "cannot unpack non-sequence {}",
                        seq.type_name(self.heap)
                    ))
                    .into());
                }
            },
            _ => {
                return Err(
                    ExcType::type_error(format!("cannot unpack non-sequence {}", seq.type_name(self.heap))).into(),
                );
            }
        };
        let expected = count as usize;
        if items.len() < expected {
            return Err(SimpleException::new_msg(
                ExcType::ValueError,
                format!("need more than {} value(s) to unpack", items.len()),
            )
            .into());
        }
        if items.len() > expected {
            return Err(SimpleException::new_msg(
                ExcType::ValueError,
                format!("too many values to unpack (expected {expected})"),
            )
            .into());
        }
        for item in items.into_iter().rev() {
            self.push(item);
        }
        Ok(())
    }

    pub(super) fn binary_subscr(&mut self) -> RunResult<()> {
        let index = self.pop()?;
        let container = self.pop()?;
        let result = {
            let mut ctx = self.ctx();
            value::py_getitem(&container, &index, &mut ctx)?
        };
        self.push(result);
        Ok(())
    }

    pub(super) fn store_subscr(&mut self) -> RunResult<()> {
        let index = self.pop()?;
        let container = self.pop()?;
        let stored = self.pop()?;
        let mut ctx = self.ctx();
        value::py_setitem(&container, &index, stored, &mut ctx)
    }

    pub(super) fn delete_subscr(&mut self) -> RunResult<()> {
        let index = self.pop()?;
        let container = self.pop()?;
        let mut ctx = self.ctx();
        value::py_delitem(&container, &index, &mut ctx)
    }
}
