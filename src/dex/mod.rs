//! Binary DEX image model and the constant-return patch engine.

#[macro_use]
pub mod error;

pub mod image;
pub mod patch;
pub(crate) mod leb;

use crate::dex::error::DexError;
use crate::dex::leb::decode_uleb128;

// Basic little-endian reading and writing against a byte slice with a cursor.

pub(crate) fn read_u1(bytes: &[u8], ix: &mut usize) -> Result<u8, DexError>
{
    if bytes.len() < *ix + 1
    {
        fail!("Unexpected end of stream reading u1 at index {}", *ix);
    }
    let result = bytes[*ix];
    *ix += 1;
    Ok(result)
}

pub(crate) fn read_u2(bytes: &[u8], ix: &mut usize) -> Result<u16, DexError>
{
    if bytes.len() < *ix + 2
    {
        fail!("Unexpected end of stream reading u2 at index {}", *ix);
    }
    let result = ((bytes[*ix + 1] as u16) << 8) | (bytes[*ix] as u16);
    *ix += 2;
    Ok(result)
}

pub(crate) fn read_u4(bytes: &[u8], ix: &mut usize) -> Result<u32, DexError>
{
    if bytes.len() < *ix + 4
    {
        fail!("Unexpected end of stream reading u4 at index {}", *ix);
    }
    let result =
        ((bytes[*ix + 3] as u32) << 24) | ((bytes[*ix + 2] as u32) << 16) | ((bytes[*ix + 1] as u32) << 8) | (bytes[*ix] as u32);
    *ix += 4;
    Ok(result)
}

pub(crate) fn read_uleb128(bytes: &[u8], ix: &mut usize) -> Result<u32, DexError>
{
    if *ix >= bytes.len()
    {
        fail!("Unexpected end of stream reading uleb128 at index {}", *ix);
    }
    let (val, size) = decode_uleb128(&bytes[*ix..]);
    *ix += size;
    Ok(val)
}

pub(crate) fn read_x(bytes: &[u8], ix: &mut usize, length: usize) -> Result<Vec<u8>, DexError>
{
    if bytes.len() - *ix >= length
    {
        let mut v = Vec::with_capacity(length + 1);
        v.extend_from_slice(&bytes[*ix..*ix + length]);
        *ix += length;
        Ok(v)
    }
    else
    {
        Err(DexError::new("buffer too short for array read"))
    }
}

pub(crate) fn write_u2(buffer: &mut Vec<u8>, val: u16) -> usize
{
    buffer.push(val as u8);
    buffer.push((val >> 8) as u8);
    2
}

pub(crate) fn write_u4(buffer: &mut Vec<u8>, val: u32) -> usize
{
    for i in 0..4
    {
        buffer.push((val >> (i * 8)) as u8);
    }
    4
}

pub(crate) fn write_x(buffer: &mut Vec<u8>, val: &[u8]) -> usize
{
    let len = val.len();
    buffer.extend(val);
    len
}

// In-place overwrites used by the patch engine; the image layout never moves.

pub(crate) fn patch_u2(bytes: &mut [u8], ix: usize, val: u16)
{
    bytes[ix] = val as u8;
    bytes[ix + 1] = (val >> 8) as u8;
}

pub(crate) fn patch_u4(bytes: &mut [u8], ix: usize, val: u32)
{
    for i in 0..4
    {
        bytes[ix + i] = (val >> (i * 8)) as u8;
    }
}
