//! Bencode encoding and decoding ([BEP-3]).
//!
//! Every KRPC datagram is a bencoded dictionary, and BEP-44 keys and
//! signatures are computed over canonical bencode, so the DHT needs an
//! encoder whose output is byte-exact:
//!
//! | Type | Format | Example |
//! |------|--------|---------|
//! | Integer | `i<number>e` | `i42e` |
//! | Byte String | `<length>:<data>` | `4:spam` |
//! | List | `l<items>e` | `l4:spami42ee` |
//! | Dictionary | `d<key><value>...e` | `d3:foo3:bare` |
//!
//! Dictionaries are backed by a `BTreeMap`, so encoding always emits keys in
//! sorted order.
//!
//! # Examples
//!
//! ```
//! use rdht::bencode::{decode, encode, Value};
//!
//! let value = decode(b"d1:ti7e1:y1:qe").unwrap();
//! assert_eq!(value.get(b"t").and_then(Value::as_integer), Some(7));
//! assert_eq!(value.get_str(b"y"), Some("q"));
//!
//! let dict = Value::dict()
//!     .insert("y", Value::string("r"))
//!     .insert("t", Value::Integer(7))
//!     .build();
//! assert_eq!(encode(&dict), b"d1:ti7e1:y1:re");
//! ```
//!
//! [BEP-3]: http://bittorrent.org/beps/bep_0003.html

mod decode;
mod encode;
mod error;
mod value;

pub use decode::decode;
pub use encode::{encode, encode_to};
pub use error::BencodeError;
pub use value::{DictBuilder, Value};
