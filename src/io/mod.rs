//! Format codecs and the decode dispatcher.
//!
//! Every codec produces the same `TimeSeriesSet`. `decode` picks the codec
//! from a closed `DocumentFormat` enum; there is no string dispatch.

use std::path::Path;

use crate::error::{Error, Result};
use crate::model::TimeSeriesSet;

pub mod columnar;
pub mod json;
#[cfg(feature = "netcdf")]
pub mod netcdf;
pub mod station;
pub mod xml;
pub mod zipped;

/// Serialization formats understood by the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentFormat {
    PiJson,
    PiXml,
    NetCdf,
    Columnar,
}

impl DocumentFormat {
    /// Value of the `documentFormat` request parameter. `None` for formats the
    /// remote service does not serve.
    pub fn as_query_value(&self) -> Option<&'static str> {
        match self {
            DocumentFormat::PiJson => Some("PI_JSON"),
            DocumentFormat::PiXml => Some("PI_XML"),
            DocumentFormat::NetCdf => Some("PI_NETCDF"),
            DocumentFormat::Columnar => None,
        }
    }
}

/// Placeholder for the parameter id in data file name templates.
pub const PARAMETER_PLACEHOLDER: &str = "{parameter_id}";

/// File-name-safe form of an id.
///
/// Path separators, characters rejected in Windows file names, template
/// braces, control characters and `%` itself are percent-encoded, so two
/// distinct ids never share a file name.
pub fn file_name_part(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for c in id.chars() {
        let escape = c.is_control()
            || matches!(
                c,
                '%' | '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | '{' | '}'
            );
        if escape {
            let mut buf = [0u8; 4];
            for byte in c.encode_utf8(&mut buf).bytes() {
                out.push_str(&format!("%{:02X}", byte));
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// File name of `parameter_id` under a template holding `{parameter_id}`.
pub fn parameter_file_name(template: &str, parameter_id: &str) -> String {
    template.replace(PARAMETER_PLACEHOLDER, &file_name_part(parameter_id))
}

/// Encoded input: raw bytes or a path on disk.
#[derive(Debug, Clone, Copy)]
pub enum Payload<'a> {
    Bytes(&'a [u8]),
    Path(&'a Path),
}

impl<'a> Payload<'a> {
    fn read(&self) -> Result<std::borrow::Cow<'a, [u8]>> {
        match self {
            Payload::Bytes(bytes) => Ok(std::borrow::Cow::Borrowed(bytes)),
            Payload::Path(path) => std::fs::read(path)
                .map(std::borrow::Cow::Owned)
                .map_err(|e| Error::io(path, e)),
        }
    }
}

/// Decode `payload` with the codec for `format`.
///
/// NetCDF bytes are expected to be the zipped archive the remote service
/// returns. Columnar input must be a path, since the header lives in a
/// companion file.
pub fn decode(payload: Payload<'_>, format: DocumentFormat) -> Result<TimeSeriesSet> {
    match format {
        DocumentFormat::PiJson => json::decode(&payload.read()?),
        DocumentFormat::PiXml => xml::decode(&payload.read()?),
        DocumentFormat::NetCdf => decode_netcdf(payload),
        DocumentFormat::Columnar => match payload {
            Payload::Path(path) => columnar::read_columnar(path),
            Payload::Bytes(_) => Err(Error::format(
                "columnar data can only be decoded from a path",
            )),
        },
    }
}

#[cfg(feature = "netcdf")]
fn decode_netcdf(payload: Payload<'_>) -> Result<TimeSeriesSet> {
    match payload {
        Payload::Path(path) => netcdf::read_netcdf(path),
        Payload::Bytes(bytes) => netcdf::read_netcdf_from_content(bytes),
    }
}

#[cfg(not(feature = "netcdf"))]
fn decode_netcdf(payload: Payload<'_>) -> Result<TimeSeriesSet> {
    if let Payload::Bytes(bytes) = payload {
        // malformed archives are a format problem whatever the build
        zipped::netcdf_entry_name(bytes)?;
    }
    Err(Error::NetCdf(
        "fewspy was built without the `netcdf` feature".to_string(),
    ))
}
