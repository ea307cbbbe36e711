//! Binding a computation to the pipes of a filter.
//!
//! Two layers:
//! - **`Computation` trait**: the typed adapter a filter drives, with declared parameter
//!   and return types plus an `invoke` over tagged values.
//! - **Closure adapters**: [`func`] wraps any `Fn(A, ..) -> R` of up to four
//!   arguments, so most filters never implement `Computation` by hand.
//!
//! `Binding` adds the optional slot names that decide which pipe feeds which
//! parameter. Unnamed slots are matched against pipes by their unique type.

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::pipe::Pipe;
use crate::pipeline::value::{DataType, PipeData, Value};
use anyhow::{anyhow, bail};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

/// A unit of work a filter runs once per set of fetched inputs.
#[cfg_attr(test, mockall::automock)]
pub trait Computation: Send + Sync {
    /// Declared parameter types, in call order.
    fn param_types(&self) -> Vec<DataType>;

    /// Declared return types, in result order.
    fn return_types(&self) -> Vec<DataType>;

    /// Run once. `args` has one value per parameter, already type-checked.
    fn invoke(&self, args: Vec<Value>) -> anyhow::Result<Vec<Value>>;
}

/// Return values of a closure computation.
///
/// Implemented for every [`PipeData`] type (one return slot), for 2- and 3-tuples
/// (several slots) and for `anyhow::Result<R>`, where an `Err` is recorded as a
/// fault of the invocation.
pub trait IntoReturns: Send + 'static {
    fn return_types() -> Vec<DataType>;
    fn into_values(self) -> anyhow::Result<Vec<Value>>;
}

impl<T: PipeData> IntoReturns for Vec<T> {
    fn return_types() -> Vec<DataType> {
        vec![<Self as PipeData>::data_type()]
    }

    fn into_values(self) -> anyhow::Result<Vec<Value>> {
        Ok(vec![self.into_value()])
    }
}

impl<A: PipeData, B: PipeData> IntoReturns for (A, B) {
    fn return_types() -> Vec<DataType> {
        vec![A::data_type(), B::data_type()]
    }

    fn into_values(self) -> anyhow::Result<Vec<Value>> {
        Ok(vec![self.0.into_value(), self.1.into_value()])
    }
}

impl<A: PipeData, B: PipeData, C: PipeData> IntoReturns for (A, B, C) {
    fn return_types() -> Vec<DataType> {
        vec![A::data_type(), B::data_type(), C::data_type()]
    }

    fn into_values(self) -> anyhow::Result<Vec<Value>> {
        Ok(vec![
            self.0.into_value(),
            self.1.into_value(),
            self.2.into_value(),
        ])
    }
}

impl<R: IntoReturns> IntoReturns for anyhow::Result<R> {
    fn return_types() -> Vec<DataType> {
        R::return_types()
    }

    fn into_values(self) -> anyhow::Result<Vec<Value>> {
        self?.into_values()
    }
}

/// Closures usable as computations. `Args` is the parameter tuple; it only exists
/// to keep the impls for different arities apart.
pub trait IntoComputation<Args>: Send + Sync + 'static {
    fn param_types() -> Vec<DataType>;
    fn return_types() -> Vec<DataType>;
    fn call(&self, args: Vec<Value>) -> anyhow::Result<Vec<Value>>;
}

macro_rules! impl_into_computation {
    ($count:expr; $($arg:ident),+) => {
        impl<Func, Ret, $($arg),+> IntoComputation<($($arg,)+)> for Func
        where
            Func: Fn($($arg),+) -> Ret + Send + Sync + 'static,
            Ret: IntoReturns,
            $($arg: PipeData),+
        {
            fn param_types() -> Vec<DataType> {
                vec![$($arg::data_type()),+]
            }

            fn return_types() -> Vec<DataType> {
                Ret::return_types()
            }

            #[allow(non_snake_case)]
            fn call(&self, args: Vec<Value>) -> anyhow::Result<Vec<Value>> {
                if args.len() != $count {
                    bail!("expected {} arguments, got {}", $count, args.len());
                }
                let mut args = args.into_iter();
                $(
                    let $arg = $arg::from_value(
                        args.next().ok_or_else(|| anyhow!("missing argument"))?,
                    )?;
                )+
                (self)($($arg),+).into_values()
            }
        }
    };
}

impl_into_computation!(1; A1);
impl_into_computation!(2; A1, A2);
impl_into_computation!(3; A1, A2, A3);
impl_into_computation!(4; A1, A2, A3, A4);

/// `Computation` over a closure.
pub struct FnComputation<F, Args> {
    func: F,
    _args: PhantomData<fn() -> Args>,
}

impl<F, Args> Computation for FnComputation<F, Args>
where
    F: IntoComputation<Args>,
    Args: 'static,
{
    fn param_types(&self) -> Vec<DataType> {
        F::param_types()
    }

    fn return_types(&self) -> Vec<DataType> {
        F::return_types()
    }

    fn invoke(&self, args: Vec<Value>) -> anyhow::Result<Vec<Value>> {
        self.func.call(args)
    }
}

/// Wrap a closure as a computation.
///
/// ```
/// use pipfil::pipeline::binding::{func, Computation};
///
/// let double = func(|x: i64| x * 2);
/// assert_eq!(double.param_types().len(), 1);
/// ```
pub fn func<Args, F>(f: F) -> Arc<dyn Computation>
where
    F: IntoComputation<Args>,
    Args: 'static,
{
    Arc::new(FnComputation {
        func: f,
        _args: PhantomData,
    })
}

/// One parameter or return position of a computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub ty: DataType,
    pub name: Option<String>,
}

/// A computation plus the names that tie its slots to pipes.
#[derive(Clone)]
pub struct Binding {
    computation: Arc<dyn Computation>,
    params: Vec<Slot>,
    returns: Vec<Slot>,
    next_in: usize,
    next_out: usize,
}

impl Binding {
    pub fn new(computation: Arc<dyn Computation>) -> Self {
        let unnamed = |ty| Slot { ty, name: None };
        let params = computation.param_types().into_iter().map(unnamed).collect();
        let returns = computation.return_types().into_iter().map(unnamed).collect();
        Self {
            computation,
            params,
            returns,
            next_in: 0,
            next_out: 0,
        }
    }

    pub fn params(&self) -> &[Slot] {
        &self.params
    }

    pub fn returns(&self) -> &[Slot] {
        &self.returns
    }

    /// Name parameter `index`.
    pub fn name_in(&mut self, index: usize, name: &str) -> PipelineResult<&mut Self> {
        name_slot(&mut self.params, index, name, "parameter")?;
        Ok(self)
    }

    /// Name return value `index`.
    pub fn name_out(&mut self, index: usize, name: &str) -> PipelineResult<&mut Self> {
        name_slot(&mut self.returns, index, name, "return")?;
        Ok(self)
    }

    /// Name the next unbound parameter after `pipe`.
    pub fn bind_in(&mut self, pipe: &Pipe) -> PipelineResult<&mut Self> {
        name_slot(&mut self.params, self.next_in, pipe.name(), "parameter")?;
        self.next_in += 1;
        Ok(self)
    }

    /// Name the next unbound return value after `pipe`.
    pub fn bind_out(&mut self, pipe: &Pipe) -> PipelineResult<&mut Self> {
        name_slot(&mut self.returns, self.next_out, pipe.name(), "return")?;
        self.next_out += 1;
        Ok(self)
    }

    /// Reject unnamed slots that share a type with another unnamed slot on the
    /// same side: they could not be told apart when matching pipes by type.
    pub fn compile(&self, filter: &str) -> PipelineResult<()> {
        check_unnamed(filter, &self.params, "parameter")?;
        check_unnamed(filter, &self.returns, "return")
    }

    /// Run the computation and check its results against the declared returns.
    pub fn invoke(&self, args: Vec<Value>) -> anyhow::Result<Vec<Value>> {
        let results = self.computation.invoke(args)?;
        if results.len() != self.returns.len() {
            bail!(
                "computation returned {} values but declares {}",
                results.len(),
                self.returns.len()
            );
        }
        for (index, (value, slot)) in results.iter().zip(&self.returns).enumerate() {
            let found = value.data_type();
            if found != slot.ty {
                bail!(
                    "return value {index} has type '{found}' but is declared as '{}'",
                    slot.ty
                );
            }
        }
        Ok(results)
    }
}

impl std::fmt::Debug for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binding")
            .field("params", &self.params)
            .field("returns", &self.returns)
            .finish()
    }
}

fn name_slot(
    slots: &mut [Slot],
    index: usize,
    name: &str,
    side: &'static str,
) -> PipelineResult<()> {
    if index >= slots.len() {
        return Err(PipelineError::SlotOutOfRange {
            side,
            index,
            arity: slots.len(),
        });
    }
    let taken = slots
        .iter()
        .enumerate()
        .any(|(i, slot)| i != index && slot.name.as_deref() == Some(name));
    if taken {
        return Err(PipelineError::NameInUse {
            name: name.to_string(),
            side,
        });
    }
    slots[index].name = Some(name.to_string());
    Ok(())
}

fn check_unnamed(filter: &str, slots: &[Slot], side: &'static str) -> PipelineResult<()> {
    let mut seen: HashMap<&DataType, usize> = HashMap::new();
    for (index, slot) in slots.iter().enumerate() {
        if slot.name.is_some() {
            continue;
        }
        if let Some(first) = seen.insert(&slot.ty, index) {
            return Err(PipelineError::AmbiguousType {
                filter: filter.to_string(),
                detail: format!(
                    "unnamed {side} slots {first} and {index} share type '{}'; name one of them",
                    slot.ty
                ),
            });
        }
    }
    Ok(())
}
