//! Conversion between JSON script arguments and ABI values.

use alloy_dyn_abi::{DynSolType, DynSolValue, FunctionExt, JsonAbiExt, Specifier};
use alloy_json_abi::{Function, JsonAbi};
use alloy_primitives::hex;
use serde_json::Value;
use thiserror::Error;

/// ABI encoding and decoding errors.
#[derive(Debug, Error)]
pub enum AbiError {
    /// The contract handle carries no compiled artifact.
    #[error("no compiled artifact for contract `{0}`")]
    MissingArtifact(String),

    /// No function with the given name and arity.
    #[error("no function `{name}` taking {arity} argument(s)")]
    UnknownFunction {
        /// Function name.
        name: String,
        /// Number of supplied arguments.
        arity: usize,
    },

    /// Wrong number of constructor arguments.
    #[error("constructor expects {expected} argument(s), got {got}")]
    ConstructorArity {
        /// Declared inputs.
        expected: usize,
        /// Supplied arguments.
        got: usize,
    },

    /// A JSON value does not fit the declared type.
    #[error("cannot convert {value} to {ty}: {reason}")]
    Coerce {
        /// Offending value.
        value: String,
        /// Target type.
        ty: String,
        /// Why the conversion failed.
        reason: String,
    },

    /// Error from the dynamic ABI codec.
    #[error(transparent)]
    Dyn(#[from] alloy_dyn_abi::Error),
}

/// ABI-encodes constructor arguments, without the bytecode prefix.
pub fn encode_constructor(abi: &JsonAbi, args: &[Value]) -> Result<Vec<u8>, AbiError> {
    let Some(constructor) = &abi.constructor else {
        if args.is_empty() {
            return Ok(Vec::new());
        }
        return Err(AbiError::ConstructorArity { expected: 0, got: args.len() });
    };
    if constructor.inputs.len() != args.len() {
        return Err(AbiError::ConstructorArity {
            expected: constructor.inputs.len(),
            got: args.len(),
        });
    }
    let values = constructor
        .inputs
        .iter()
        .zip(args)
        .map(|(param, arg)| coerce(&param.resolve()?, arg))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(constructor.abi_encode_input(&values)?)
}

/// Finds the overload of `name` taking `arity` arguments.
pub fn lookup_function<'a>(
    abi: &'a JsonAbi,
    name: &str,
    arity: usize,
) -> Result<&'a Function, AbiError> {
    abi.function(name)
        .and_then(|overloads| overloads.iter().find(|f| f.inputs.len() == arity))
        .ok_or_else(|| AbiError::UnknownFunction { name: name.to_string(), arity })
}

/// ABI-encodes a call to `function`, including the selector.
pub fn encode_call(function: &Function, args: &[Value]) -> Result<Vec<u8>, AbiError> {
    let values = function
        .inputs
        .iter()
        .zip(args)
        .map(|(param, arg)| coerce(&param.resolve()?, arg))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(function.abi_encode_input(&values)?)
}

/// Decodes the return data of `function`.
pub fn decode_output(function: &Function, data: &[u8]) -> Result<Vec<DynSolValue>, AbiError> {
    Ok(function.abi_decode_output(data)?)
}

/// Converts a JSON value into an ABI value of type `ty`.
///
/// Numbers may be given as JSON numbers or decimal/hex strings; arrays and
/// tuples as JSON arrays.
pub fn coerce(ty: &DynSolType, value: &Value) -> Result<DynSolValue, AbiError> {
    let error = |reason: &str| AbiError::Coerce {
        value: value.to_string(),
        ty: ty.to_string(),
        reason: reason.to_string(),
    };

    match (ty, value) {
        (DynSolType::Bool, Value::Bool(b)) => Ok(DynSolValue::Bool(*b)),
        (DynSolType::Array(inner), Value::Array(items)) => Ok(DynSolValue::Array(
            items.iter().map(|item| coerce(inner, item)).collect::<Result<_, _>>()?,
        )),
        (DynSolType::FixedArray(inner, len), Value::Array(items)) => {
            if items.len() != *len {
                return Err(error("wrong array length"));
            }
            Ok(DynSolValue::FixedArray(
                items.iter().map(|item| coerce(inner, item)).collect::<Result<_, _>>()?,
            ))
        }
        (DynSolType::Tuple(types), Value::Array(items)) => {
            if items.len() != types.len() {
                return Err(error("wrong tuple length"));
            }
            Ok(DynSolValue::Tuple(
                types.iter().zip(items).map(|(ty, item)| coerce(ty, item)).collect::<Result<_, _>>()?,
            ))
        }
        (_, Value::String(s)) => ty.coerce_str(s).map_err(|err| error(&err.to_string())),
        (_, Value::Number(n)) => ty.coerce_str(&n.to_string()).map_err(|err| error(&err.to_string())),
        (_, Value::Bool(b)) => ty.coerce_str(&b.to_string()).map_err(|err| error(&err.to_string())),
        _ => Err(error("unsupported JSON shape")),
    }
}

/// Renders decoded values for logging.
pub fn format_values(values: &[DynSolValue]) -> String {
    let rendered: Vec<String> = values.iter().map(format_value).collect();
    format!("[{}]", rendered.join(", "))
}

fn format_value(value: &DynSolValue) -> String {
    match value {
        DynSolValue::Bool(b) => b.to_string(),
        DynSolValue::Int(i, _) => i.to_string(),
        DynSolValue::Uint(u, _) => u.to_string(),
        DynSolValue::Address(a) => a.to_checksum(None),
        DynSolValue::String(s) => format!("{s:?}"),
        DynSolValue::Bytes(b) => hex::encode_prefixed(b),
        DynSolValue::FixedBytes(word, size) => hex::encode_prefixed(&word[..*size]),
        DynSolValue::Array(items) | DynSolValue::FixedArray(items) | DynSolValue::Tuple(items) => {
            format_values(items)
        }
        other => format!("{other:?}"),
    }
}
