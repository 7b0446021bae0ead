use super::value::Value;

/// Encodes a value to canonical bencode.
///
/// Writing into a `Vec` cannot fail, so unlike decoding this returns the
/// buffer directly.
///
/// # Examples
///
/// ```
/// use rdht::bencode::{encode, Value};
///
/// assert_eq!(encode(&Value::Integer(-3)), b"i-3e");
/// assert_eq!(encode(&Value::string("Hello World!")), b"12:Hello World!");
/// ```
pub fn encode(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_to(value, &mut buf);
    buf
}

/// Appends the encoding of `value` to `buf`.
///
/// Used to build partial dictionaries such as the BEP-44 signature payload.
pub fn encode_to(value: &Value, buf: &mut Vec<u8>) {
    match value {
        Value::Integer(i) => {
            buf.push(b'i');
            buf.extend_from_slice(i.to_string().as_bytes());
            buf.push(b'e');
        }
        Value::Bytes(b) => write_bytes(b, buf),
        Value::List(l) => {
            buf.push(b'l');
            for item in l {
                encode_to(item, buf);
            }
            buf.push(b'e');
        }
        Value::Dict(d) => {
            buf.push(b'd');
            for (key, val) in d {
                write_bytes(key, buf);
                encode_to(val, buf);
            }
            buf.push(b'e');
        }
    }
}

fn write_bytes(bytes: &[u8], buf: &mut Vec<u8>) {
    buf.extend_from_slice(bytes.len().to_string().as_bytes());
    buf.push(b':');
    buf.extend_from_slice(bytes);
}
