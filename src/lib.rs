use std::error::Error;

pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod observe;
pub mod remote;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;

pub fn unpack_error(err: &(dyn Error)) -> String {
    let mut parts = Vec::new();
    parts.push(err.to_string());
    let mut current = err.source();
    while let Some(source) = current {
        parts.push(source.to_string());
        current = source.source();
    }
    parts.join(": ")
}
