// Script reply decoding.
//
// Replies are arrays of small integers, but what actually arrives depends on
// the server, the protocol revision, and any proxy in between: integers may
// come back as RESP integers or as integer-valued doubles. Accept both,
// reject everything else.

use redis::Value;

use crate::error::Error;

/// Decode a script reply into integers, requiring at least `min_len`
/// elements.
pub(crate) fn decode_int_array(raw: &Value, min_len: usize) -> Result<Vec<i64>, Error> {
    let Value::Array(items) = raw else {
        return Err(Error::UnexpectedScriptResult(format!("expected an array, got {raw:?}")));
    };
    if items.len() < min_len {
        return Err(Error::UnexpectedScriptResult(format!(
            "expected at least {min_len} elements, got {}",
            items.len()
        )));
    }
    items.iter().map(decode_int).collect()
}

fn decode_int(value: &Value) -> Result<i64, Error> {
    match value {
        Value::Int(int) => Ok(*int),
        Value::Double(double) if is_exact_int(*double) => Ok(*double as i64),
        other => Err(Error::UnexpectedScriptResult(format!("expected an integer, got {other:?}"))),
    }
}

fn is_exact_int(double: f64) -> bool {
    double.is_finite()
        && double.fract() == 0.0
        && double >= i64::MIN as f64
        && double <= i64::MAX as f64
}
