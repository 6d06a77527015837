//! Function pointer values: argument resolution and rebinding.
//!
//! A function pointer describes how the caller's argument list maps onto the
//! target's parameters. Each parameter has a source:
//!
//! - `0`: a fixed value carried by the pointer
//! - `N > 0`: required caller argument `N`
//! - `N < 0`: caller argument `|N|` if supplied, else the carried value
//!
//! Vararg pointers additionally pass every caller argument from
//! `first_unused_source` onwards into the target's rest array.

use hsvm_core::{ErrorCode, VariableType};

use crate::error::RuntimeError;
use crate::group::VmId;
use crate::library::LibraryId;
use crate::stack::Args;
use crate::value::Value;

/// One parameter of a function pointer.
#[derive(Clone, Debug, PartialEq)]
pub struct FptrParam {
    pub ty: VariableType,
    pub source: i32,
    /// Fixed value (source 0) or fallback (negative source).
    pub value: Option<Value>,
}

impl FptrParam {
    pub fn required(ty: VariableType, source: i32) -> Self {
        Self { ty, source, value: None }
    }

    pub fn optional(ty: VariableType, source: i32, fallback: Value) -> Self {
        Self {
            ty,
            source: -source.saturating_abs(),
            value: Some(fallback),
        }
    }

    pub fn fixed(ty: VariableType, value: Value) -> Self {
        Self {
            ty,
            source: 0,
            value: Some(value),
        }
    }

    pub fn is_optional(&self) -> bool {
        self.source < 0
    }
}

/// A bound or partially bound reference to a function.
#[derive(Clone, Debug, PartialEq)]
pub struct FunctionPtr {
    pub library: LibraryId,
    pub function: u32,
    /// VM that owns the target; calls from other VMs are transferred there.
    pub vm: VmId,
    pub return_type: VariableType,
    /// Element type of vararg overflow arguments, if the pointer accepts them.
    pub vararg: Option<VariableType>,
    pub first_unused_source: i32,
    pub params: Vec<FptrParam>,
}

impl FunctionPtr {
    /// Build the target's argument list from the caller's arguments.
    pub fn resolve_arguments(&self, args: &[Value]) -> Result<Args, RuntimeError> {
        let mut resolved = Args::with_capacity(self.params.len());
        for (i, param) in self.params.iter().enumerate() {
            let value = match param.source {
                0 => param.value.clone().ok_or_else(|| {
                    RuntimeError::new(ErrorCode::ParameterNotBound, [(i + 1).to_string()])
                })?,
                source if source > 0 => args
                    .get(source as usize - 1)
                    .cloned()
                    .ok_or_else(|| too_few(source))?,
                source => match args.get(source.unsigned_abs() as usize - 1) {
                    Some(arg) => arg.clone(),
                    None => param.value.clone().ok_or_else(|| too_few(-source))?,
                },
            };
            resolved.push(value.cast_to(param.ty)?);
        }

        let first_unused = self.first_unused_source.max(1) as usize;
        match self.vararg {
            Some(elem) => {
                for arg in args.iter().skip(first_unused - 1) {
                    resolved.push(arg.clone().cast_to(elem)?);
                }
            }
            None if args.len() >= first_unused => {
                return Err(RuntimeError::new(
                    ErrorCode::TooManyArguments,
                    [(first_unused - 1).to_string(), args.len().to_string()],
                ));
            }
            None => {}
        }
        Ok(resolved)
    }

    /// The same pointer with `receiver` bound as the first parameter.
    ///
    /// Caller argument N then feeds what used to be argument N + 1.
    pub(crate) fn with_receiver(mut self, receiver: Value) -> Self {
        for param in &mut self.params {
            param.source = match param.source {
                0 => 0,
                s if s > 0 => s - 1,
                s => s + 1,
            };
        }
        if let Some(first) = self.params.first_mut() {
            first.source = 0;
            first.value = Some(receiver);
        }
        self.first_unused_source = (self.first_unused_source - 1).max(1);
        self
    }
}

fn too_few(position: i32) -> RuntimeError {
    RuntimeError::new(ErrorCode::TooFewArguments, [position.to_string()])
}

/// Accept a function pointer value, rejecting other types and the default pointer.
pub fn expect_function_ptr(value: &Value) -> Result<std::rc::Rc<FunctionPtr>, RuntimeError> {
    match value {
        Value::FunctionPtr(Some(ptr)) => Ok(ptr.clone()),
        Value::FunctionPtr(None) => Err(RuntimeError::bare(ErrorCode::UnboundFunctionPtr)),
        other => Err(RuntimeError::new(
            ErrorCode::NotAFunctionPtr,
            [other.variable_type().name()],
        )),
    }
}

/// Parameters of a rebind.
///
/// Both tables are indexed by the old caller position minus one.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RebindRequest {
    /// New source for each old caller position: 0 drops it, negative makes it optional.
    pub passthrough: Vec<i32>,
    /// Value bound to each old caller position.
    pub bound: Vec<Option<Value>>,
    pub first_unused_source: Option<i32>,
    pub keep_vararg: bool,
}

impl RebindRequest {
    /// Pass positions `1..=count` through unchanged.
    pub fn identity(count: usize, keep_vararg: bool) -> Self {
        Self {
            passthrough: (1..=count as i32).collect(),
            bound: Vec::new(),
            first_unused_source: None,
            keep_vararg,
        }
    }

    fn source_for(&self, position: usize) -> i32 {
        self.passthrough.get(position - 1).copied().unwrap_or(0)
    }

    fn bound_for(&self, position: usize) -> Option<Value> {
        self.bound.get(position - 1).cloned().flatten()
    }

    /// Highest old caller position the request refers to.
    fn highest_position(&self) -> usize {
        let passed = self.passthrough.iter().rposition(|&s| s != 0).map_or(0, |i| i + 1);
        let bound = self.bound.iter().rposition(Option::is_some).map_or(0, |i| i + 1);
        passed.max(bound)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Phase {
    Required,
    Optional,
}

/// Tracks the required -> optional ordering of the new parameters.
struct OrderCheck {
    phase: Phase,
    last_optional: i32,
    highest: i32,
}

impl OrderCheck {
    fn new() -> Self {
        Self {
            phase: Phase::Required,
            last_optional: 0,
            highest: 0,
        }
    }

    fn accept(&mut self, param: &FptrParam, position: usize) -> Result<(), RuntimeError> {
        let source = param.source.abs();
        if source == 0 {
            return match self.phase {
                Phase::Optional => Err(ordering(position)),
                Phase::Required => Ok(()),
            };
        }
        self.highest = self.highest.max(source);
        if param.is_optional() {
            if source < self.last_optional {
                return Err(ordering(position));
            }
            self.phase = Phase::Optional;
            self.last_optional = source;
        } else if self.phase == Phase::Optional {
            return Err(ordering(position));
        }
        Ok(())
    }
}

fn ordering(position: usize) -> RuntimeError {
    RuntimeError::new(ErrorCode::RebindOrdering, [position.to_string()])
}

/// Recompute a parameter for the new pointer.
///
/// `old_optional` and `fallback` describe the parameter before the rebind;
/// `position` is the old caller position feeding it.
fn remap(
    ty: VariableType,
    old_optional: bool,
    fallback: Option<Value>,
    position: usize,
    request: &RebindRequest,
) -> Result<FptrParam, RuntimeError> {
    let new_source = request.source_for(position);
    // One past the highest source must still fit `first_unused_source`.
    if new_source.unsigned_abs() >= i32::MAX.unsigned_abs() {
        return Err(RuntimeError::new(
            ErrorCode::TooManyArguments,
            [(i32::MAX - 1).to_string(), new_source.unsigned_abs().to_string()],
        ));
    }
    let bound = request.bound_for(position);

    if new_source == 0 {
        return match bound.or(if old_optional { fallback } else { None }) {
            Some(value) => Ok(FptrParam::fixed(ty, value.cast_to(ty)?)),
            None if old_optional => Err(RuntimeError::new(
                ErrorCode::RebindNoDefault,
                [position.to_string()],
            )),
            None => Err(RuntimeError::new(
                ErrorCode::ParameterNotBound,
                [position.to_string()],
            )),
        };
    }

    let optional = old_optional || new_source < 0 || bound.is_some();
    if !optional {
        return Ok(FptrParam::required(ty, new_source));
    }
    match bound.or(fallback) {
        Some(value) => Ok(FptrParam::optional(ty, new_source, value.cast_to(ty)?)),
        None => Err(RuntimeError::new(
            ErrorCode::RebindNoDefault,
            [position.to_string()],
        )),
    }
}

/// Produce a new function pointer by recomposing the parameter sources of `ptr`.
pub fn rebind(ptr: &FunctionPtr, request: &RebindRequest) -> Result<FunctionPtr, RuntimeError> {
    let mut order = OrderCheck::new();
    let mut params = Vec::with_capacity(ptr.params.len());

    for param in &ptr.params {
        let new_param = match param.source {
            0 => param.clone(),
            source => {
                let position = source.unsigned_abs() as usize;
                let new_param =
                    remap(param.ty, param.is_optional(), param.value.clone(), position, request)?;
                order.accept(&new_param, position)?;
                new_param
            }
        };
        params.push(new_param);
    }

    let first_unused = ptr.first_unused_source.max(1) as usize;
    let highest = request.highest_position();
    if highest >= first_unused {
        let Some(elem) = ptr.vararg else {
            return Err(RuntimeError::new(
                ErrorCode::TooManyArguments,
                [(first_unused - 1).to_string(), highest.to_string()],
            ));
        };
        // Overflow positions become real parameters of the new pointer.
        for position in first_unused..=highest {
            let new_param = remap(elem, false, None, position, request)?;
            order.accept(&new_param, position)?;
            params.push(new_param);
        }
    }

    let first_unused_source = match request.first_unused_source {
        Some(requested) if requested <= order.highest => {
            return Err(ordering(requested as usize));
        }
        Some(requested) => requested,
        None => order
            .highest
            .checked_add(1)
            .ok_or_else(|| ordering(order.highest.unsigned_abs() as usize))?,
    };

    Ok(FunctionPtr {
        library: ptr.library,
        function: ptr.function,
        vm: ptr.vm,
        return_type: ptr.return_type,
        vararg: if request.keep_vararg { ptr.vararg } else { None },
        first_unused_source,
        params,
    })
}
