//! Call mechanics: argument collection, binding, and frame construction.
//!
//! A call opcode pops keyword pairs, then positionals, then the callable.
//! Built-in functions and exception-class constructors run synchronously;
//! calling a user function binds its arguments into fresh fast-local slots,
//! seeds parameter cells, and pushes a new frame on the VM's frame array -
//! the dispatch loop simply continues there.

use std::sync::Arc;

use crate::{
    bytecode::code::{CELL_NOT_AN_ARG, CO_GENERATOR, CO_VARARGS, CO_VARKEYWORDS, Code},
    exception::{ExcType, RunError, RunResult, SimpleException},
    heap::{ExcInstance, Function, HeapData, HeapId},
    intern::StringId,
    io::PrintWriter,
    value::{Value, hash_key},
};

use super::{Frame, Vm};

impl<P: PrintWriter> Vm<'_, P> {
    /// Shared implementation of the `CALL_FUNCTION` family. `var` and `kw`
    /// select the trailing `*args` iterable and `**kwargs` mapping.
    pub(super) fn call_function(&mut self, argc: u32, var: bool, kw: bool) -> RunResult<()> {
        let star_kwargs = if kw { Some(self.pop()?) } else { None };
        let star_args = if var { Some(self.pop()?) } else { None };

        let nkw = ((argc >> 8) & 0xFF) as usize;
        let npos = (argc & 0xFF) as usize;

        let mut kwargs: Vec<(StringId, Value)> = Vec::with_capacity(nkw);
        for _ in 0..nkw {
            let value = self.pop()?;
            let name = self.pop()?;
            let Value::Str(id) = name else {
                return Err(ExcType::type_error("keywords must be strings").into());
            };
            kwargs.push((id, value));
        }
        kwargs.reverse();

        let mut args = self.pop_n(npos)?;
        let callable = self.pop()?;

        if let Some(star) = star_args {
            match star {
                Value::Ref(id) => match self.heap.get(id) {
                    HeapData::Tuple(items) | HeapData::List(items) => args.extend_from_slice(items),
                    _ => return Err(self.star_args_error(&star)),
                },
                _ => return Err(self.star_args_error(&star)),
            }
        }

        if let Some(mapping) = star_kwargs {
            let entries = match mapping {
                Value::Ref(id) => match self.heap.get(id) {
                    HeapData::Dict(entries) => entries.clone(),
                    _ => return Err(self.star_kwargs_error(&mapping)),
                },
                _ => return Err(self.star_kwargs_error(&mapping)),
            };
            for (key, value) in entries.into_values() {
                let Value::Str(id) = key else {
                    return Err(ExcType::type_error("keywords must be strings").into());
                };
                if kwargs.iter().any(|(existing, _)| *existing == id) {
                    return Err(ExcType::type_error(format!(
                        "got multiple values for keyword argument '{}'",
                        self.interns.get_str(id)
                    ))
                    .into());
                }
                kwargs.push((id, value));
            }
        }

        self.call_value(callable, args, kwargs)
    }

    fn star_args_error(&self, value: &Value) -> RunError {
        ExcType::type_error(format!(
            "argument after * must be an iterable, not {}",
            value.type_name(self.heap)
        ))
        .into()
    }

    fn star_kwargs_error(&self, value: &Value) -> RunError {
        ExcType::type_error(format!(
            "argument after ** must be a mapping, not {}",
            value.type_name(self.heap)
        ))
        .into()
    }

    /// Dispatches a call on a resolved callable.
    pub(super) fn call_value(
        &mut self,
        callable: Value,
        args: Vec<Value>,
        kwargs: Vec<(StringId, Value)>,
    ) -> RunResult<()> {
        match callable {
            Value::Builtin(builtin) => {
                let result = {
                    let mut ctx = crate::value::RtCtx {
                        heap: &mut *self.heap,
                        interns: &mut *self.interns,
                    };
                    builtin.call(args, kwargs, &mut ctx, &mut *self.print)?
                };
                self.push(result);
                Ok(())
            }
            Value::Class(exc_type) => {
                if !kwargs.is_empty() {
                    return Err(ExcType::type_error(format!("{exc_type}() takes no keyword arguments")).into());
                }
                let id = self.heap.allocate(HeapData::Exception(ExcInstance {
                    exc_type,
                    args,
                    cause: None,
                }));
                self.push(Value::Ref(id));
                Ok(())
            }
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Function(func) => {
                    let func = func.clone();
                    self.call_user_function(&func, args, kwargs)
                }
                _ => Err(ExcType::not_callable(callable.type_name(self.heap))),
            },
            other => Err(ExcType::not_callable(other.type_name(self.heap))),
        }
    }

    /// Binds arguments and pushes a new frame for a user function. There is
    /// no re-entrant invocation of the dispatch loop; returning later pops
    /// the frame and pushes the result on our stack.
    fn call_user_function(
        &mut self,
        func: &Function,
        args: Vec<Value>,
        kwargs: Vec<(StringId, Value)>,
    ) -> RunResult<()> {
        let code = Arc::clone(&func.code);
        if code.has_flag(CO_GENERATOR) {
            return Err(RunError::internal("generator functions are not executable yet"));
        }

        let fast = self.bind_arguments(func, &code, args, kwargs)?;
        let mut fast = fast;

        // Allocate cell storage: parameter cells are seeded from (and
        // replace) their fast-local slot, then captured cells follow.
        let mut cells: Vec<HeapId> = Vec::with_capacity(code.cellvars.len() + code.freevars.len());
        for (i, _) in code.cellvars.iter().enumerate() {
            let seed = match code.cell2arg.get(i) {
                Some(&slot) if slot != CELL_NOT_AN_ARG => fast
                    .get_mut(slot as usize)
                    .ok_or_else(|| RunError::internal("cell2arg slot out of range"))?
                    .take(),
                _ => None,
            };
            cells.push(self.heap.allocate(HeapData::Cell(seed)));
        }
        if func.closure.len() != code.freevars.len() {
            return Err(RunError::internal("closure length does not match free variable count"));
        }
        cells.extend_from_slice(&func.closure);

        let locals = self.namespaces.allocate();
        let frame = Frame::new_function(code, locals, func.globals, fast, cells);
        self.push_frame(frame);
        Ok(())
    }

    /// Binds positional and keyword arguments into fast-local slots,
    /// applying defaults and collecting varargs, with the classic
    /// TypeErrors for arity mismatches.
    fn bind_arguments(
        &mut self,
        func: &Function,
        code: &Code,
        args: Vec<Value>,
        kwargs: Vec<(StringId, Value)>,
    ) -> RunResult<Vec<Option<Value>>> {
        let argcount = code.argcount as usize;
        let total_args = argcount + code.kwonlyargcount as usize;
        let mut fast: Vec<Option<Value>> = vec![None; code.nlocals as usize];

        let kwdict_slot = if code.has_flag(CO_VARKEYWORDS) {
            let slot = total_args + usize::from(code.has_flag(CO_VARARGS));
            Some(slot)
        } else {
            None
        };
        let mut kwdict: Vec<(Value, Value)> = Vec::new();

        let bound_positional = args.len().min(argcount);
        for (slot, value) in args.iter().take(bound_positional).enumerate() {
            fast[slot] = Some(*value);
        }
        if args.len() > argcount {
            if code.has_flag(CO_VARARGS) {
                let rest = args[argcount..].to_vec();
                fast[total_args] = Some(Value::Ref(self.heap.allocate(HeapData::Tuple(rest))));
            } else {
                return Err(self.too_many_positional(func, code, args.len()));
            }
        } else if code.has_flag(CO_VARARGS) {
            fast[total_args] = Some(Value::Ref(self.heap.allocate(HeapData::Tuple(Vec::new()))));
        }

        for (name, value) in kwargs {
            let slot = code.varnames[..total_args].iter().position(|n| *n == name);
            match slot {
                Some(slot) => {
                    if fast[slot].is_some() {
                        return Err(SimpleException::new_msg(
                            ExcType::TypeError,
                            format!(
                                "{}() got multiple values for argument '{}'",
                                self.interns.get_str(func.qualname),
                                self.interns.get_str(name)
                            ),
                        )
                        .into());
                    }
                    fast[slot] = Some(value);
                }
                None => {
                    if kwdict_slot.is_some() {
                        kwdict.push((Value::Str(name), value));
                    } else {
                        return Err(SimpleException::new_msg(
                            ExcType::TypeError,
                            format!(
                                "{}() got an unexpected keyword argument '{}'",
                                self.interns.get_str(func.qualname),
                                self.interns.get_str(name)
                            ),
                        )
                        .into());
                    }
                }
            }
        }

        if let Some(slot) = kwdict_slot {
            let mut entries = indexmap::IndexMap::with_capacity(kwdict.len());
            for (key, value) in kwdict {
                let hashed = hash_key(&key, self.heap)?;
                entries.insert(hashed, (key, value));
            }
            fast[slot] = Some(Value::Ref(self.heap.allocate(HeapData::Dict(entries))));
        }

        // Fill defaults for trailing positional parameters.
        let defcount = func.defaults.len();
        let first_default = argcount - defcount.min(argcount);
        let missing: Vec<usize> = (0..argcount).filter(|slot| fast[*slot].is_none()).collect();
        for slot in missing {
            if slot >= first_default {
                fast[slot] = Some(func.defaults[slot - first_default]);
            }
        }
        let still_missing: Vec<String> = (0..argcount)
            .filter(|slot| fast[*slot].is_none())
            .map(|slot| self.interns.get_str(code.varnames[slot]).to_owned())
            .collect();
        if !still_missing.is_empty() {
            return Err(self.missing_arguments(func, "positional", &still_missing));
        }

        // Keyword-only parameters and their defaults.
        let mut missing_kwonly: Vec<String> = Vec::new();
        for slot in argcount..total_args {
            if fast[slot].is_some() {
                continue;
            }
            let name = code.varnames[slot];
            match func.kwdefaults.iter().find(|(n, _)| *n == name) {
                Some((_, default)) => fast[slot] = Some(*default),
                None => missing_kwonly.push(self.interns.get_str(name).to_owned()),
            }
        }
        if !missing_kwonly.is_empty() {
            return Err(self.missing_arguments(func, "keyword-only", &missing_kwonly));
        }

        Ok(fast)
    }

    fn too_many_positional(&self, func: &Function, code: &Code, given: usize) -> RunError {
        let argcount = code.argcount as usize;
        let defcount = func.defaults.len();
        let sig = if defcount != 0 {
            format!("from {} to {argcount}", argcount - defcount)
        } else {
            argcount.to_string()
        };
        let plural = defcount != 0 || argcount != 1;
        SimpleException::new_msg(
            ExcType::TypeError,
            format!(
                "{}() takes {sig} positional argument{} but {given} {} given",
                self.interns.get_str(func.qualname),
                if plural { "s" } else { "" },
                if given == 1 { "was" } else { "were" },
            ),
        )
        .into()
    }

    fn missing_arguments(&self, func: &Function, kind: &str, names: &[String]) -> RunError {
        let name_list = match names {
            [single] => format!("'{single}'"),
            [first, second] => format!("'{first}' and '{second}'"),
            _ => {
                let head: Vec<String> = names[..names.len() - 1].iter().map(|n| format!("'{n}'")).collect();
                format!("{}, and '{}'", head.join(", "), names[names.len() - 1])
            }
        };
        SimpleException::new_msg(
            ExcType::TypeError,
            format!(
                "{}() missing {} required {kind} argument{}: {name_list}",
                self.interns.get_str(func.qualname),
                names.len(),
                if names.len() == 1 { "" } else { "s" },
            ),
        )
        .into()
    }

    /// `MAKE_FUNCTION` / `MAKE_CLOSURE`: pops qualified name, code object,
    /// (for closures) the cell tuple, then keyword-only and positional
    /// defaults, and pushes the function object.
    pub(super) fn make_function(&mut self, arg: u32, closure: bool) -> RunResult<()> {
        let posdefaults = (arg & 0xFF) as usize;
        let kwdefaults = ((arg >> 8) & 0xFF) as usize;
        let num_annotations = (arg >> 16) & 0x7FFF;
        if num_annotations != 0 {
            return Err(RunError::internal("annotations are not supported by MAKE_FUNCTION"));
        }

        let qualname = match self.pop()? {
            Value::Str(id) => id,
            _ => return Err(RunError::internal("MAKE_FUNCTION qualname is not a string")),
        };
        let code = match self.pop()? {
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Code(code) => Arc::clone(code),
                _ => return Err(RunError::internal("MAKE_FUNCTION operand is not a code object")),
            },
            _ => return Err(RunError::internal("MAKE_FUNCTION operand is not a code object")),
        };

        let mut cells: Vec<HeapId> = Vec::new();
        if closure {
            match self.pop()? {
                Value::Ref(id) => match self.heap.get(id) {
                    HeapData::Tuple(items) => {
                        for item in items {
                            match item {
                                Value::Ref(cell) => cells.push(*cell),
                                _ => return Err(RunError::internal("closure tuple holds a non-cell")),
                            }
                        }
                    }
                    _ => return Err(RunError::internal("MAKE_CLOSURE operand is not a tuple")),
                },
                _ => return Err(RunError::internal("MAKE_CLOSURE operand is not a tuple")),
            }
        }

        let mut kw_pairs: Vec<(StringId, Value)> = Vec::with_capacity(kwdefaults);
        for _ in 0..kwdefaults {
            let value = self.pop()?;
            let name = match self.pop()? {
                Value::Str(id) => id,
                _ => return Err(RunError::internal("keyword default name is not a string")),
            };
            kw_pairs.push((name, value));
        }
        kw_pairs.reverse();

        let mut defaults = self.pop_n(posdefaults)?;
        defaults.shrink_to_fit();

        let globals = self.frame_ref().globals;
        let id = self.heap.allocate(HeapData::Function(Function {
            code,
            qualname,
            defaults,
            kwdefaults: kw_pairs,
            closure: cells,
            globals,
        }));
        self.push(Value::Ref(id));
        Ok(())
    }
}
