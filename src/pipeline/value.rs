//! Tagged values that travel through pipes.
//!
//! Pipes are declared with a [`DataType`] and carry [`Value`]s: a type tag plus a
//! shared payload. Filters never touch `Value` directly; the closure adapters in
//! [`binding`](crate::pipeline::binding) convert to and from concrete Rust types
//! through [`PipeData`].
//!
//! A sequence is a first-class value (`Value::Seq`). When a computation returns
//! `Vec<T>` into a pipe declared as `T`, the filter streams the elements one at a
//! time instead (see [`DataType::streams_from`]).

use std::any::{type_name, Any, TypeId};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Runtime type tag of a pipe or of a computation slot.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum DataType {
    /// A single value of a concrete Rust type.
    Item { id: TypeId, name: &'static str },
    /// A sequence of the inner type.
    Seq(Box<DataType>),
}

impl DataType {
    /// Tag for any `'static` type.
    pub fn item<T: Any>() -> Self {
        DataType::Item {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }

    /// Tag for a registered pipe type (including `Vec<T>` sequences).
    pub fn of<T: PipeData>() -> Self {
        T::data_type()
    }

    pub fn seq(elem: DataType) -> Self {
        DataType::Seq(Box::new(elem))
    }

    pub fn is_seq(&self) -> bool {
        matches!(self, DataType::Seq(_))
    }

    /// Element type of a sequence tag.
    pub fn element(&self) -> Option<&DataType> {
        match self {
            DataType::Seq(elem) => Some(elem),
            DataType::Item { .. } => None,
        }
    }

    /// True when a slot of this type is fed (or drained) one element at a time
    /// through a pipe declared as `pipe`.
    pub fn streams_from(&self, pipe: &DataType) -> bool {
        self.element() == Some(pipe)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Item { name, .. } => f.write_str(name),
            DataType::Seq(elem) => write!(f, "[{elem}]"),
        }
    }
}

impl fmt::Debug for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DataType({self})")
    }
}

/// A value did not have the type the receiver expected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("expected a value of type '{expected}', found '{found}'")]
pub struct ValueTypeError {
    pub expected: DataType,
    pub found: DataType,
}

/// A type-tagged, cheaply clonable payload.
#[derive(Clone)]
pub enum Value {
    Item {
        ty: DataType,
        data: Arc<dyn Any + Send + Sync>,
    },
    Seq {
        elem: DataType,
        items: Vec<Value>,
    },
}

impl Value {
    /// Wrap any registered pipe type.
    pub fn new<T: PipeData>(value: T) -> Self {
        value.into_value()
    }

    /// Wrap a single payload. Used by [`pipe_data!`](crate::pipe_data).
    pub fn item<T: Any + Send + Sync>(value: T) -> Self {
        Value::Item {
            ty: DataType::item::<T>(),
            data: Arc::new(value),
        }
    }

    /// Build a sequence from already wrapped elements of type `elem`.
    ///
    /// Every item must carry `elem`; use [`try_seq`](Self::try_seq) for elements of
    /// unknown origin.
    pub fn seq(elem: DataType, items: Vec<Value>) -> Self {
        debug_assert!(
            items.iter().all(|item| item.data_type() == elem),
            "sequence of '{elem}' holds an element of another type"
        );
        Value::Seq { elem, items }
    }

    /// Build a sequence, rejecting the first element that does not carry `elem`.
    pub fn try_seq(elem: DataType, items: Vec<Value>) -> Result<Self, ValueTypeError> {
        if let Some(item) = items.iter().find(|item| item.data_type() != elem) {
            return Err(ValueTypeError {
                expected: elem,
                found: item.data_type(),
            });
        }
        Ok(Value::Seq { elem, items })
    }

    pub fn data_type(&self) -> DataType {
        match self {
            Value::Item { ty, .. } => ty.clone(),
            Value::Seq { elem, .. } => DataType::seq(elem.clone()),
        }
    }

    /// Borrow the payload of a single value.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Value::Item { data, .. } => data.downcast_ref::<T>(),
            Value::Seq { .. } => None,
        }
    }

    /// Clone the payload out as a concrete type.
    pub fn get<T: PipeData>(&self) -> Option<T> {
        T::from_value(self.clone()).ok()
    }

    /// Elements of a sequence value.
    pub fn items(&self) -> Option<&[Value]> {
        match self {
            Value::Seq { items, .. } => Some(items),
            Value::Item { .. } => None,
        }
    }

    /// Unwrap a single value, cloning only when the payload is shared.
    pub fn take_item<T: Any + Send + Sync + Clone>(self) -> Result<T, ValueTypeError> {
        let expected = DataType::item::<T>();
        match self {
            Value::Item { data, ty } => match data.downcast::<T>() {
                Ok(arc) => Ok(Arc::try_unwrap(arc).unwrap_or_else(|shared| (*shared).clone())),
                Err(_) => Err(ValueTypeError { expected, found: ty }),
            },
            other => Err(ValueTypeError {
                expected,
                found: other.data_type(),
            }),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Item { ty, .. } => write!(f, "Value({ty})"),
            Value::Seq { items, .. } => f.debug_list().entries(items).finish(),
        }
    }
}

/// Rust types that can flow through a pipe.
///
/// Implemented for the primitive types, `String` and `Vec<T>`. Other types opt in
/// with [`pipe_data!`](crate::pipe_data).
pub trait PipeData: Clone + Send + Sync + 'static {
    fn data_type() -> DataType;
    fn into_value(self) -> Value;
    fn from_value(value: Value) -> Result<Self, ValueTypeError>;
}

impl<T: PipeData> PipeData for Vec<T> {
    fn data_type() -> DataType {
        DataType::seq(T::data_type())
    }

    fn into_value(self) -> Value {
        Value::Seq {
            elem: T::data_type(),
            items: self.into_iter().map(PipeData::into_value).collect(),
        }
    }

    fn from_value(value: Value) -> Result<Self, ValueTypeError> {
        match value {
            Value::Seq { elem, items } if elem == T::data_type() => {
                items.into_iter().map(T::from_value).collect()
            }
            other => Err(ValueTypeError {
                expected: Self::data_type(),
                found: other.data_type(),
            }),
        }
    }
}

/// Register types as pipe payloads.
///
/// ```
/// #[derive(Clone)]
/// struct Reading { id: u32, celsius: f64 }
///
/// pipfil::pipe_data!(Reading);
///
/// let value = pipfil::Value::new(Reading { id: 7, celsius: 21.5 });
/// assert_eq!(value.get::<Reading>().map(|r| r.id), Some(7));
/// ```
#[macro_export]
macro_rules! pipe_data {
    ($($ty:ty),+ $(,)?) => {$(
        impl $crate::pipeline::value::PipeData for $ty {
            fn data_type() -> $crate::pipeline::value::DataType {
                $crate::pipeline::value::DataType::item::<$ty>()
            }

            fn into_value(self) -> $crate::pipeline::value::Value {
                $crate::pipeline::value::Value::item(self)
            }

            fn from_value(
                value: $crate::pipeline::value::Value,
            ) -> ::std::result::Result<Self, $crate::pipeline::value::ValueTypeError> {
                value.take_item::<$ty>()
            }
        }

        impl $crate::pipeline::binding::IntoReturns for $ty {
            fn return_types() -> ::std::vec::Vec<$crate::pipeline::value::DataType> {
                ::std::vec![<$ty as $crate::pipeline::value::PipeData>::data_type()]
            }

            fn into_values(self) -> $crate::anyhow::Result<::std::vec::Vec<$crate::pipeline::value::Value>> {
                ::std::result::Result::Ok(::std::vec![
                    $crate::pipeline::value::PipeData::into_value(self)
                ])
            }
        }
    )+};
}

pipe_data!(
    i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, f32, f64, bool, char,
    String, ()
);
