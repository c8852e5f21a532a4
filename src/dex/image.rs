/* Parsed DEX image over an owned byte buffer, with in-place method rewriting */

use crate::dex::error::DexError;
use crate::dex::patch::{encode_const_return, ForcedValue, PatchError, ReturnKind, OP_NOP};
use crate::dex::{patch_u2, patch_u4, read_u1, read_u2, read_u4, read_uleb128, read_x, write_u4, write_x};
use adler::adler32_slice;
use cesu8::to_java_cesu8;
use log::debug;
use sha1::{Digest, Sha1};

/* Constants */
pub const ENDIAN_CONSTANT: u32 = 0x12345678;
pub const NO_INDEX: u32 = 0xffffffff;
pub const HEADER_SIZE: u32 = 0x70;

/* Access flags relevant to method patching */
pub const ACC_NATIVE: u32 = 0x100;
pub const ACC_ABSTRACT: u32 = 0x400;

type StringId = usize;
type TypeId = usize;
type ProtoId = usize;

#[derive(Debug, PartialEq, Eq)]
pub struct Header {
    pub magic: [u8; 8],
    pub checksum: u32,
    pub signature: [u8; 20],
    pub file_size: u32,
    pub header_size: u32,
    pub endian_tag: u32,
    pub link_size: u32,
    pub link_off: u32,
    pub map_off: u32,
    pub string_ids_size: u32,
    pub string_ids_off: u32,
    pub type_ids_size: u32,
    pub type_ids_off: u32,
    pub proto_ids_size: u32,
    pub proto_ids_off: u32,
    pub field_ids_size: u32,
    pub field_ids_off: u32,
    pub method_ids_size: u32,
    pub method_ids_off: u32,
    pub class_defs_size: u32,
    pub class_defs_off: u32,
    pub data_size: u32,
    pub data_off: u32,
}

impl Header
{
    pub fn read(bytes: &[u8], ix: &mut usize) -> Result<Header, DexError>
    {
        if bytes.len() < HEADER_SIZE as usize {
            fail!("Not enough bytes for header");
        }

        let magic = <[u8; 8]>::try_from(read_x(bytes, ix, 8)?).unwrap();
        // "dex\n0NN\0" where NN are ASCII version digits
        if magic[0] != 0x64 || magic[1] != 0x65 || magic[2] != 0x78 || magic[3] != 0x0a {
            fail!("Invalid magic value");
        }
        if magic[4] != b'0' || !magic[5].is_ascii_digit() || !magic[6].is_ascii_digit() || magic[7] != 0 {
            fail!("Invalid version in magic: {:02x?}", &magic[4..8]);
        }

        Ok(Header {
            magic,
            checksum: read_u4(bytes, ix)?,
            signature: <[u8; 20]>::try_from(read_x(bytes, ix, 20)?).unwrap(),
            file_size: read_u4(bytes, ix)?,
            header_size: read_u4(bytes, ix)?,
            endian_tag: read_u4(bytes, ix)?,
            link_size: read_u4(bytes, ix)?,
            link_off: read_u4(bytes, ix)?,
            map_off: read_u4(bytes, ix)?,
            string_ids_size: read_u4(bytes, ix)?,
            string_ids_off: read_u4(bytes, ix)?,
            type_ids_size: read_u4(bytes, ix)?,
            type_ids_off: read_u4(bytes, ix)?,
            proto_ids_size: read_u4(bytes, ix)?,
            proto_ids_off: read_u4(bytes, ix)?,
            field_ids_size: read_u4(bytes, ix)?,
            field_ids_off: read_u4(bytes, ix)?,
            method_ids_size: read_u4(bytes, ix)?,
            method_ids_off: read_u4(bytes, ix)?,
            class_defs_size: read_u4(bytes, ix)?,
            class_defs_off: read_u4(bytes, ix)?,
            data_size: read_u4(bytes, ix)?,
            data_off: read_u4(bytes, ix)?,
        })
    }

    /// Numeric DEX version from the magic, e.g. 35, 39, 41.
    pub fn dex_version(&self) -> u32 {
        ((self.magic[5] - b'0') as u32) * 10 + ((self.magic[6] - b'0') as u32)
    }
}

/// A string pool item. Names that fail MUTF-8 decoding are kept raw so the
/// rest of the pool stays addressable; they can never match a keyword.
#[derive(Debug, Eq, PartialEq, Clone)]
pub enum DexString
{
    Decoded(String),
    Raw(u32, Vec<u8>),
}

impl DexString
{
    pub fn read(bytes: &[u8], ix: &mut usize) -> Result<DexString, DexError>
    {
        let utf16_size = read_uleb128(bytes, ix)?;
        let mut v = vec![];

        loop
        {
            let u = read_u1(bytes, ix)?;
            if u != 0 { v.push(u); }
            else { break; }
        }

        Ok(match cesu8::from_java_cesu8(v.as_slice())
        {
            Ok(converted_str) => DexString::Decoded(converted_str.to_string()),
            _ => DexString::Raw(utf16_size, v)
        })
    }

    pub(crate) fn write(&self, bytes: &mut Vec<u8>) -> usize
    {
        let mut c = 0;
        match self
        {
            DexString::Raw(utf16_size, v) => {
                c += crate::dex::leb::encode_uleb128(*utf16_size).len();
                bytes.extend(crate::dex::leb::encode_uleb128(*utf16_size));
                c += write_x(bytes, v);
                bytes.push(0);
                c += 1;
            },
            DexString::Decoded(s) => {
                let encoded = to_java_cesu8(s).to_vec();
                let len = crate::dex::leb::encode_uleb128(s.chars().count() as u32);
                c += len.len();
                bytes.extend(len);
                c += write_x(bytes, encoded.as_slice());
                bytes.push(0);
                c += 1;
            }
        }
        c
    }
}

#[derive(Debug)]
pub struct ProtoItem {
    pub shorty_idx: StringId,
    pub return_type_idx: TypeId,
    pub parameters: Vec<TypeId>,
}

#[derive(Debug, PartialEq, Eq)]
pub struct FieldItem {
    pub class_idx: TypeId,
    pub type_idx: TypeId,
    pub name_idx: StringId,
}

#[derive(Debug, PartialEq, Eq)]
pub struct MethodItem {
    pub class_idx: TypeId,
    pub proto_idx: ProtoId,
    pub name_idx: StringId,
}

/// A method entry inside class_data: its pool index, flags and the absolute
/// file offset of its code_item (0 for abstract and native methods).
#[derive(Debug, Clone, Copy)]
pub struct EncodedMethod
{
    pub method_idx: usize,
    pub access_flags: u32,
    pub code_off: u32,
}

#[derive(Debug)]
pub struct ClassData {
    pub direct_methods: Vec<EncodedMethod>,
    pub virtual_methods: Vec<EncodedMethod>,
}

impl ClassData
{
    pub fn read(bytes: &[u8], ix: &mut usize) -> Result<ClassData, DexError>
    {
        let static_field_size = read_uleb128(bytes, ix)?;
        let instance_field_size = read_uleb128(bytes, ix)?;
        let direct_method_size = read_uleb128(bytes, ix)?;
        let virtual_method_size = read_uleb128(bytes, ix)?;

        // Fields are not patch targets; consume their (idx_diff, flags) pairs.
        for _ in 0..(static_field_size + instance_field_size) {
            read_uleb128(bytes, ix)?;
            read_uleb128(bytes, ix)?;
        }

        let mut direct_methods = vec![];
        let mut virtual_methods = vec![];

        let mut offset = 0;
        for _ in 0..direct_method_size {
            offset += read_uleb128(bytes, ix)? as usize;
            let access_flags = read_uleb128(bytes, ix)?;
            let code_off = read_uleb128(bytes, ix)?;
            direct_methods.push(EncodedMethod { method_idx: offset, access_flags, code_off });
        }

        offset = 0;
        for _ in 0..virtual_method_size {
            offset += read_uleb128(bytes, ix)? as usize;
            let access_flags = read_uleb128(bytes, ix)?;
            let code_off = read_uleb128(bytes, ix)?;
            virtual_methods.push(EncodedMethod { method_idx: offset, access_flags, code_off });
        }

        Ok(ClassData { direct_methods, virtual_methods })
    }
}

#[derive(Debug)]
pub struct ClassDefItem {
    pub class_idx: TypeId,
    pub access_flags: u32,
    pub superclass_idx: u32,
    pub source_file_idx: u32,
    pub class_data: Option<ClassData>,
}

impl ClassDefItem
{
    pub fn read(bytes: &[u8], ix: &mut usize) -> Result<ClassDefItem, DexError>
    {
        let class_idx = read_u4(bytes, ix)? as TypeId;
        let access_flags = read_u4(bytes, ix)?;
        let superclass_idx = read_u4(bytes, ix)?;
        let _interfaces_off = read_u4(bytes, ix)?;
        let source_file_idx = read_u4(bytes, ix)?;
        let _annotations_off = read_u4(bytes, ix)?;
        let mut class_data_off = read_u4(bytes, ix)? as usize;
        let class_data = if class_data_off > 0 {
            Some(ClassData::read(bytes, &mut class_data_off)
                .map_err(|e| DexError::with_context(e, format!("class_def with type index {}", class_idx)))?)
        } else { None };
        let _static_values_off = read_u4(bytes, ix)?;

        Ok(ClassDefItem { class_idx, access_flags, superclass_idx, source_file_idx, class_data })
    }
}

/// Resolved identity of one method, enough to match and to describe a fix.
#[derive(Debug, Clone)]
pub struct MethodRef {
    pub class_desc: String,
    pub name: String,
    pub shorty: String,
    pub return_type: Result<ReturnKind, PatchError>,
    pub descriptor: String,
}

impl MethodRef {
    /// `Lcom/app/Security;->isRooted()Z` form used in fix descriptions.
    pub fn qualified_name(&self) -> String {
        format!("{}->{}{}", self.class_desc, self.name, self.descriptor)
    }
}

/// A single patchable site: a resolved method plus its code_item offset.
#[derive(Debug, Clone)]
pub struct MethodTarget {
    pub method: MethodRef,
    pub access_flags: u32,
    pub code_off: u32,
}

/// One parsed DEX binary. Owns the raw bytes exclusively; all mutation is
/// surgical (within existing code_item slots) so offsets, the map list and
/// 4-byte alignment survive untouched.
#[derive(Debug)]
pub struct DexImage {
    pub header: Header,
    strings: Vec<DexString>,
    types: Vec<StringId>,
    protos: Vec<ProtoItem>,
    fields: Vec<FieldItem>,
    methods: Vec<MethodItem>,
    class_defs: Vec<ClassDefItem>,
    bytes: Vec<u8>,
    modified: bool,
}

impl DexImage {

    pub fn parse(bytes: &[u8]) -> Result<DexImage, DexError>
    {
        let mut ix = 0;
        let header = Header::read(bytes, &mut ix)?;

        if header.file_size as usize != bytes.len() {
            fail!("file_size {} does not match input length {}", header.file_size, bytes.len());
        }
        if header.header_size != HEADER_SIZE {
            fail!("unexpected header_size 0x{:x}", header.header_size);
        }
        if header.endian_tag != ENDIAN_CONSTANT {
            fail!("unsupported endian_tag 0x{:08x}", header.endian_tag);
        }

        let mut image = DexImage {
            header,
            strings: vec![],
            types: vec![],
            protos: vec![],
            fields: vec![],
            methods: vec![],
            class_defs: vec![],
            bytes: bytes.to_vec(),
            modified: false,
        };

        // Strings
        ix = image.header.string_ids_off as usize;
        for _ in 0..image.header.string_ids_size
        {
            let mut string_off = read_u4(bytes, &mut ix)? as usize;
            image.strings.push(DexString::read(bytes, &mut string_off)?);
        }

        // Type ids: indices into the string pool
        ix = image.header.type_ids_off as usize;
        for _ in 0..image.header.type_ids_size
        {
            let string_idx = read_u4(bytes, &mut ix)? as StringId;
            if string_idx >= image.strings.len() {
                fail!("type_id string index {} out of range", string_idx);
            }
            image.types.push(string_idx);
        }

        // Prototypes
        ix = image.header.proto_ids_off as usize;
        for _ in 0..image.header.proto_ids_size
        {
            let shorty_idx = read_u4(bytes, &mut ix)? as StringId;
            let return_type_idx = read_u4(bytes, &mut ix)? as TypeId;
            if shorty_idx >= image.strings.len() || return_type_idx >= image.types.len() {
                fail!("proto_id pool index out of range");
            }
            let mut parameters_off = read_u4(bytes, &mut ix)? as usize;
            let parameters = if parameters_off == 0 { vec![] } else {
                let size = read_u4(bytes, &mut parameters_off)?;
                let mut v = Vec::with_capacity(size as usize);
                for _ in 0..size { v.push(read_u2(bytes, &mut parameters_off)? as TypeId); }
                v
            };
            image.protos.push(ProtoItem { shorty_idx, return_type_idx, parameters });
        }

        // Field ids
        ix = image.header.field_ids_off as usize;
        for _ in 0..image.header.field_ids_size
        {
            let field = FieldItem {
                class_idx: read_u2(bytes, &mut ix)? as TypeId,
                type_idx: read_u2(bytes, &mut ix)? as TypeId,
                name_idx: read_u4(bytes, &mut ix)? as StringId,
            };
            if field.type_idx >= image.types.len() || field.name_idx >= image.strings.len() {
                fail!("field_id pool index out of range");
            }
            image.fields.push(field);
        }

        // Method ids
        ix = image.header.method_ids_off as usize;
        for _ in 0..image.header.method_ids_size
        {
            let method = MethodItem {
                class_idx: read_u2(bytes, &mut ix)? as TypeId,
                proto_idx: read_u2(bytes, &mut ix)? as ProtoId,
                name_idx: read_u4(bytes, &mut ix)? as StringId,
            };
            if method.class_idx >= image.types.len()
                || method.proto_idx >= image.protos.len()
                || method.name_idx >= image.strings.len() {
                fail!("method_id pool index out of range");
            }
            image.methods.push(method);
        }

        // Class defs
        ix = image.header.class_defs_off as usize;
        for _ in 0..image.header.class_defs_size
        {
            image.class_defs.push(ClassDefItem::read(bytes, &mut ix)?);
        }

        debug!(
            "parsed dex v{}: {} strings, {} types, {} methods, {} classes",
            image.header.dex_version(),
            image.strings.len(),
            image.types.len(),
            image.methods.len(),
            image.class_defs.len()
        );

        Ok(image)
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// Emit the image bytes. Unmodified images come back verbatim; modified
    /// ones get the SHA-1 signature and Adler-32 checksum rewritten over the
    /// final byte stream — the runtime rejects the file if either is stale.
    pub fn serialize(mut self) -> Vec<u8> {
        if self.modified {
            seal_bytes(&mut self.bytes);
            let mut ix = 8;
            self.header.checksum = read_u4(&self.bytes, &mut ix).unwrap_or(0);
            if let Ok(sig) = read_x(&self.bytes, &mut ix, 20) {
                self.header.signature.copy_from_slice(&sig);
            }
        }
        self.bytes
    }

    fn string(&self, id: StringId) -> String {
        match self.strings.get(id) {
            Some(DexString::Decoded(s)) => s.clone(),
            _ => format!("string@{}", id),
        }
    }

    fn type_desc(&self, id: TypeId) -> String {
        match self.types.get(id) {
            Some(&sid) => self.string(sid),
            None => format!("Ltype@{};", id),
        }
    }

    fn proto_descriptor(&self, proto: &ProtoItem) -> String {
        let mut s = String::from("(");
        for &t in &proto.parameters { s.push_str(&self.type_desc(t)); }
        s.push(')');
        s.push_str(&self.type_desc(proto.return_type_idx));
        s
    }

    pub fn class_count(&self) -> usize {
        self.class_defs.len()
    }

    pub fn method_count(&self) -> usize {
        self.methods.len()
    }

    fn method_ref(&self, method_idx: usize) -> Result<MethodRef, DexError>
    {
        let item = self.methods.get(method_idx)
            .ok_or_else(|| DexError::new(&format!("method index {} out of range", method_idx)))?;
        let proto = &self.protos[item.proto_idx];
        let return_desc = self.type_desc(proto.return_type_idx);

        Ok(MethodRef {
            class_desc: self.type_desc(item.class_idx),
            name: self.string(item.name_idx),
            shorty: self.string(proto.shorty_idx),
            return_type: ReturnKind::from_descriptor(&return_desc),
            descriptor: self.proto_descriptor(proto),
        })
    }

    /// Every method of every class that carries a code item reference,
    /// direct then virtual, in class_def order.
    pub fn method_targets(&self) -> Result<Vec<MethodTarget>, DexError>
    {
        let mut targets = vec![];
        for def in &self.class_defs {
            if let Some(data) = &def.class_data {
                for m in data.direct_methods.iter().chain(data.virtual_methods.iter()) {
                    targets.push(MethodTarget {
                        method: self.method_ref(m.method_idx)?,
                        access_flags: m.access_flags,
                        code_off: m.code_off,
                    });
                }
            }
        }
        Ok(targets)
    }

    /// Replace the body at `code_off` with a constant-return sequence.
    ///
    /// The new body is written into the existing code_item slot: the header
    /// words are updated (`outs_size`, `tries_size` and `debug_info_off`
    /// zeroed, `insns_size` recomputed), the instructions overwritten, and
    /// the remainder of the old insns region nop-filled. `registers_size`
    /// shrinks to what the new body and the incoming arguments need and is
    /// never increased.
    pub fn rewrite_to_constant(&mut self, target: &MethodTarget, forced: ForcedValue) -> Result<(), PatchError>
    {
        if target.code_off == 0 || target.access_flags & (ACC_NATIVE | ACC_ABSTRACT) != 0 {
            return Err(PatchError::UnsupportedReturnType(format!(
                "{} has no code item (abstract or native)",
                target.method.qualified_name()
            )));
        }
        let kind = target.method.return_type.clone()?;

        let off = target.code_off as usize;
        if off % 4 != 0 || off + 16 > self.bytes.len() {
            return Err(PatchError::Encoding(format!("code_item offset 0x{:x} invalid", off)));
        }

        let mut ix = off;
        let registers_size = read_u2(&self.bytes, &mut ix).map_err(|e| PatchError::Encoding(e.to_string()))?;
        let ins_size = read_u2(&self.bytes, &mut ix).map_err(|e| PatchError::Encoding(e.to_string()))?;
        ix = off + 12;
        let insns_size = read_u4(&self.bytes, &mut ix).map_err(|e| PatchError::Encoding(e.to_string()))? as usize;
        if off + 16 + insns_size * 2 > self.bytes.len() {
            return Err(PatchError::Encoding("code_item insns run past end of file".to_string()));
        }

        let units = encode_const_return(kind, forced, 0)?;
        if units.len() > insns_size {
            return Err(PatchError::Encoding(format!(
                "replacement body ({} units) larger than original ({} units)",
                units.len(),
                insns_size
            )));
        }
        let needed = kind.register_demand();
        if registers_size < needed {
            return Err(PatchError::Encoding(format!(
                "method has {} registers, replacement needs {}",
                registers_size, needed
            )));
        }
        // Verifier requires registers_size >= ins_size; never grow the file.
        let new_registers = needed.max(ins_size).min(registers_size);

        patch_u2(&mut self.bytes, off, new_registers);
        patch_u2(&mut self.bytes, off + 4, 0); // outs_size
        patch_u2(&mut self.bytes, off + 6, 0); // tries_size: handlers are unreachable now
        patch_u4(&mut self.bytes, off + 8, 0); // debug_info_off: no line mapping for synthetic code
        patch_u4(&mut self.bytes, off + 12, units.len() as u32);
        for (i, unit) in units.iter().enumerate() {
            patch_u2(&mut self.bytes, off + 16 + i * 2, *unit);
        }
        for i in units.len()..insns_size {
            patch_u2(&mut self.bytes, off + 16 + i * 2, OP_NOP);
        }

        self.modified = true;
        Ok(())
    }
}

/// Recompute the SHA-1 signature (over everything after the signature
/// field) and then the Adler-32 checksum (over everything after the
/// checksum field, signature included) into the header.
pub(crate) fn seal_bytes(bytes: &mut [u8])
{
    let mut hasher = Sha1::new();
    hasher.update(&bytes[32..]);
    let digest = hasher.finalize();
    bytes[12..32].copy_from_slice(&digest);

    let checksum = adler32_slice(&bytes[12..]);
    let mut tmp = Vec::with_capacity(4);
    write_u4(&mut tmp, checksum);
    bytes[8..12].copy_from_slice(&tmp);
}

/// Verify the two header digests against the byte stream; used by tests and
/// by callers that want to sanity-check third-party DEX files.
pub fn verify_seal(bytes: &[u8]) -> Result<(), DexError>
{
    if bytes.len() < HEADER_SIZE as usize {
        fail!("Not enough bytes for header");
    }
    let mut ix = 8;
    let stored_checksum = read_u4(bytes, &mut ix)?;
    let stored_signature = read_x(bytes, &mut ix, 20)?;

    let mut hasher = Sha1::new();
    hasher.update(&bytes[32..]);
    if hasher.finalize().as_slice() != stored_signature.as_slice() {
        fail!("SHA-1 signature mismatch");
    }
    if adler32_slice(&bytes[12..]) != stored_checksum {
        fail!("Adler-32 checksum mismatch");
    }
    Ok(())
}
