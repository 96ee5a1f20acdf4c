//! # Storage Layer
//!
//! Binary codecs and file plumbing underneath the tree:
//!
//! - `page`: the 16-byte page header shared by every page kind
//! - `node`: the entries of branch and leaf pages
//! - `meta`: the two alternating meta pages and 48-byte tree records
//! - `idl`: sorted page-number sets and the write transaction's dirty list
//! - `mmap`: the data file — shared read-only map plus positioned writes
//!
//! Everything on disk is host-endian; the magic number doubles as the
//! byte-order check. On-disk structs are `zerocopy` views over page
//! memory, parsed in place and never copied into owned representations.

pub mod idl;
pub mod meta;
pub mod mmap;
pub mod node;
pub mod page;

use eyre::{ensure, Result};
use zerocopy::byteorder::NativeEndian;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Host-endian integer wrappers used by every on-disk struct.
pub type U16 = zerocopy::byteorder::U16<NativeEndian>;
pub type U32 = zerocopy::byteorder::U32<NativeEndian>;
pub type U64 = zerocopy::byteorder::U64<NativeEndian>;

/// Parses a zerocopy struct from a byte slice with size validation.
#[inline]
pub fn parse_zerocopy<'a, T: FromBytes + KnownLayout + Immutable>(
    bytes: &'a [u8],
    type_name: &str,
) -> Result<&'a T> {
    let size = std::mem::size_of::<T>();
    ensure!(
        bytes.len() >= size,
        "buffer too small for {}: {} < {}",
        type_name,
        bytes.len(),
        size
    );
    T::ref_from_bytes(&bytes[..size])
        .map_err(|e| eyre::eyre!("failed to parse {}: {:?}", type_name, e))
}

/// Parses a mutable zerocopy struct from a byte slice with size validation.
#[inline]
pub fn parse_zerocopy_mut<'a, T: FromBytes + KnownLayout + Immutable + IntoBytes>(
    bytes: &'a mut [u8],
    type_name: &str,
) -> Result<&'a mut T> {
    let size = std::mem::size_of::<T>();
    ensure!(
        bytes.len() >= size,
        "buffer too small for {}: {} < {}",
        type_name,
        bytes.len(),
        size
    );
    T::mut_from_bytes(&mut bytes[..size])
        .map_err(|e| eyre::eyre!("failed to parse {}: {:?}", type_name, e))
}
