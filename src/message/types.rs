use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use uuid::Uuid;

use crate::error::{Result, RpcError};

/// Join key between a request and its reply. 128 random bits, assigned
/// once by the client when the call is created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new() -> Self {
        CorrelationId(Uuid::new_v4().to_string())
    }

    pub fn from_raw(id: impl Into<String>) -> Self {
        CorrelationId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A value that can cross the RPC boundary.
///
/// `type_name` feeds the operation-name suffix, so client and server must
/// produce the same name for the same logical type.
pub trait RpcType: Serialize + DeserializeOwned + Send + 'static {
    fn type_name() -> String;
}

macro_rules! impl_rpc_type {
    ($($ty:ty => $name:expr),* $(,)?) => {
        $(
            impl RpcType for $ty {
                fn type_name() -> String {
                    $name.to_string()
                }
            }
        )*
    };
}

impl_rpc_type!(
    i8 => "Int8",
    i16 => "Int16",
    i32 => "Int32",
    i64 => "Int64",
    u8 => "UInt8",
    u16 => "UInt16",
    u32 => "UInt32",
    u64 => "UInt64",
    f32 => "Single",
    f64 => "Double",
    bool => "Boolean",
    char => "Char",
    String => "String",
    () => "Void",
    Value => "Value",
);

impl<T: RpcType> RpcType for Vec<T> {
    fn type_name() -> String {
        format!("{}[]", T::type_name())
    }
}

impl<T: RpcType> RpcType for Option<T> {
    fn type_name() -> String {
        format!("{}?", T::type_name())
    }
}

impl<K, V> RpcType for HashMap<K, V>
where
    K: RpcType + Eq + Hash,
    V: RpcType,
{
    fn type_name() -> String {
        format!("Map[{},{}]", K::type_name(), V::type_name())
    }
}

impl<K, V> RpcType for BTreeMap<K, V>
where
    K: RpcType + Ord,
    V: RpcType,
{
    fn type_name() -> String {
        format!("Map[{},{}]", K::type_name(), V::type_name())
    }
}

/// Opt a user type into [`RpcType`], named after its Rust identifier.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct Point { x: i32, y: i32 }
/// mqrpc::rpc_type!(Point);
/// ```
#[macro_export]
macro_rules! rpc_type {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl $crate::RpcType for $ty {
                fn type_name() -> String {
                    stringify!($ty).to_string()
                }
            }
        )+
    };
}

/// Ordered argument list of a call, expressed as a tuple of [`RpcType`]s.
pub trait RpcArgs: Sized + Send + 'static {
    fn type_names() -> Vec<String>;

    fn into_values(self) -> Result<Vec<Value>>;

    fn from_values(values: Vec<Value>) -> Result<Self>;
}

macro_rules! impl_rpc_args {
    ($len:expr; $($ty:ident),*) => {
        impl<$($ty: RpcType),*> RpcArgs for ($($ty,)*) {
            fn type_names() -> Vec<String> {
                vec![$($ty::type_name()),*]
            }

            #[allow(non_snake_case)]
            fn into_values(self) -> Result<Vec<Value>> {
                let ($($ty,)*) = self;
                Ok(vec![$(serde_json::to_value($ty)?),*])
            }

            #[allow(non_snake_case, unused_mut, unused_variables)]
            fn from_values(values: Vec<Value>) -> Result<Self> {
                if values.len() != $len {
                    return Err(RpcError::InvalidMessage(format!(
                        "expected {} arguments, got {}",
                        $len,
                        values.len()
                    )));
                }
                let mut iter = values.into_iter();
                $(
                    let $ty: $ty = serde_json::from_value(iter.next().unwrap_or(Value::Null))?;
                )*
                Ok(($($ty,)*))
            }
        }
    };
}

impl_rpc_args!(0;);
impl_rpc_args!(1; A);
impl_rpc_args!(2; A, B);
impl_rpc_args!(3; A, B, C);
impl_rpc_args!(4; A, B, C, D);
impl_rpc_args!(5; A, B, C, D, E);
impl_rpc_args!(6; A, B, C, D, E, F);

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Point {
        x: i32,
        y: i32,
    }

    crate::rpc_type!(Point);

    #[test]
    fn test_correlation_ids_are_unique() {
        let a = CorrelationId::new();
        let b = CorrelationId::new();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }

    #[test]
    fn test_type_names() {
        assert_eq!(i32::type_name(), "Int32");
        assert_eq!(<()>::type_name(), "Void");
        assert_eq!(Vec::<String>::type_name(), "String[]");
        assert_eq!(Option::<u64>::type_name(), "UInt64?");
        assert_eq!(HashMap::<String, f64>::type_name(), "Map[String,Double]");
        assert_eq!(Point::type_name(), "Point");
    }

    #[test]
    fn test_args_type_names_follow_position() {
        assert_eq!(<(i32, String)>::type_names(), vec!["Int32", "String"]);
        assert!(<()>::type_names().is_empty());
    }

    #[test]
    fn test_args_values() {
        let args = (41i32, "a".to_string(), Point { x: 1, y: 2 });
        let values = args.clone().into_values().unwrap();
        assert_eq!(values.len(), 3);
        assert_eq!(values[0], Value::from(41));

        let decoded = <(i32, String, Point)>::from_values(values).unwrap();
        assert_eq!(decoded, args);
    }

    #[test]
    fn test_args_arity_mismatch() {
        let result = <(i32, i32)>::from_values(vec![Value::from(1)]);
        assert!(matches!(result, Err(RpcError::InvalidMessage(_))));
    }

    #[test]
    fn test_args_type_mismatch() {
        let result = <(i32,)>::from_values(vec![Value::from("nope")]);
        assert!(matches!(result, Err(RpcError::Serialization(_))));
    }
}
