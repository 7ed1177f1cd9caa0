//! Layout profiles
//!
//! A `LayoutProfile` captures everything that differs between builds of the
//! host: field offsets of the core object model, how the global tables are
//! laid out, flag bits, the end-of-parameters marker, and the named byte
//! patterns used to find the tables. Profiles are TOML documents and are
//! immutable once a [`crate::Host`] has been created from one.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

use crate::scan::Pattern;

/// Errors that can occur while loading a layout profile
#[derive(Debug, Error)]
pub enum ProfileError {
    /// Failed to read the profile file
    #[error("Failed to read profile file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML
    #[error("Failed to parse profile: {0}")]
    Parse(#[from] toml::de::Error),

    /// Profile parsed but is not usable
    #[error("Invalid profile: {0}")]
    Validation(String),
}

/// Calling convention of the host's member-function entry points
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallingConvention {
    /// Platform C convention (x86-64 and every non-x86 target)
    #[default]
    Native,
    /// `this` in ECX, callee cleans the stack (32-bit Windows only)
    Thiscall,
}

/// Layout of one global table (names or objects)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableLayout {
    /// Offset from the table base to the element (or chunk pointer) array
    #[serde(default)]
    pub data_offset: usize,

    /// Whether `data_offset` holds a pointer to the array instead of the array itself
    #[serde(default = "default_true")]
    pub data_is_pointer: bool,

    /// Offset from the table base to the 32-bit element count
    pub count_offset: usize,

    /// Distance between consecutive elements
    pub stride: usize,

    /// Elements per chunk; absent for a flat table
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<usize>,
}

/// Name table layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NameTableLayout {
    /// Table shape; each element is a pointer to a name entry
    pub table: TableLayout,

    /// Name entry layout
    pub entry: NameEntryLayout,
}

/// Layout of a single interned name entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NameEntryLayout {
    /// Offset of the 32-bit word carrying the wide-character bit
    pub flags_offset: usize,

    /// Mask selecting the wide-character bit
    #[serde(default = "default_wide_mask")]
    pub wide_mask: u32,

    /// Offset of the null-terminated character data
    pub text_offset: usize,

    /// Upper bound on characters read from a single entry
    #[serde(default = "default_max_name_len")]
    pub max_len: usize,
}

/// Object table layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectTableLayout {
    /// Table shape; each element is an object item
    pub table: TableLayout,

    /// Object item layout
    pub item: ObjectItemLayout,
}

/// Layout of one object table slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectItemLayout {
    /// Offset of the object pointer within the slot
    #[serde(default)]
    pub object_offset: usize,

    /// Offset of the 32-bit slot flags, if the slot carries any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags_offset: Option<usize>,

    /// Slot flag bits marking an object as pending kill or unreachable
    #[serde(default)]
    pub dead_mask: u32,
}

/// Offsets shared by every host object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectLayout {
    /// Object flags (32-bit)
    pub flags: usize,
    /// Index of the object in the object table (32-bit)
    pub internal_index: usize,
    /// Class pointer
    pub class: usize,
    /// Name (32-bit name index, optionally followed by a 32-bit number)
    pub name: usize,
    /// Outer pointer
    pub outer: usize,
    /// Whether the name index is followed by an instance number
    #[serde(default = "default_true")]
    pub name_has_number: bool,
}

/// Offsets of field descriptors (the common base of properties and functions)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldLayout {
    /// Pointer to the next field owned by the same struct
    pub next: usize,
}

/// Offsets of struct and class descriptors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructLayout {
    /// Parent struct pointer
    pub super_struct: usize,
    /// Head of the owned field list
    pub children: usize,
    /// Instance size (32-bit)
    pub properties_size: usize,
    /// Minimum alignment (32-bit)
    pub min_alignment: usize,
}

/// Offsets of class descriptors beyond the struct part
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassLayout {
    /// Dynamic array of implemented interfaces
    pub interfaces: usize,
    /// Layout of one implemented-interface record
    pub interface: InterfaceEntryLayout,
}

/// Layout of one implemented-interface record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceEntryLayout {
    /// Interface class pointer
    pub class: usize,
    /// Offset of the interface vtable from the object base (32-bit)
    pub pointer_offset: usize,
    /// Whether the interface is implemented natively (32-bit bool)
    pub implemented_natively: usize,
    /// Size of one record
    pub stride: usize,
}

/// How boolean properties locate their bit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum BoolLayout {
    /// Byte offset and byte mask stored in the descriptor
    Byte {
        /// Offset of the 8-bit byte offset within the descriptor
        byte_offset: usize,
        /// Offset of the 8-bit field mask within the descriptor
        field_mask: usize,
    },
    /// 32-bit mask stored in the descriptor, applied to the word at the property offset
    Word {
        /// Offset of the 32-bit mask within the descriptor
        mask: usize,
    },
}

/// Offsets of property descriptors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyLayout {
    /// Static array dimension (32-bit)
    pub array_dim: usize,
    /// Size of one element (32-bit)
    pub element_size: usize,
    /// Property flags (64-bit)
    pub property_flags: usize,
    /// Offset of the value within its owner (32-bit)
    pub offset: usize,
    /// Bit location of boolean properties
    pub bool: BoolLayout,
    /// Inner property of a dynamic array property
    pub inner: usize,
    /// Struct descriptor of a nested-struct property
    pub struct_type: usize,
    /// Declared class of an object or class property
    pub property_class: usize,
    /// Meta-class of a class property
    pub meta_class: usize,
    /// Declared interface of an interface property
    pub interface_class: usize,
}

/// Offsets of function descriptors beyond the struct part
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionLayout {
    /// Function flags (32-bit)
    pub function_flags: usize,
}

/// Offsets of the bytecode interpreter frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameLayout {
    /// Function being executed
    pub node: usize,
    /// Context object
    pub object: usize,
    /// Bytecode cursor
    pub code: usize,
    /// Opcode terminating the parameter list
    #[serde(default = "default_end_of_params")]
    pub end_of_params: u8,
}

/// Host string encoding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StringLayout {
    /// Bytes per character of host strings (1 or 2)
    #[serde(default = "default_char_width")]
    pub char_width: usize,
}

impl Default for StringLayout {
    fn default() -> Self {
        Self {
            char_width: default_char_width(),
        }
    }
}

/// Flag bits the runtime reads or toggles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlagBits {
    /// Function flag marking a native implementation
    pub function_native: u32,
    /// Property flag marking a parameter
    pub param: u64,
    /// Property flag marking an out parameter
    pub out_param: u64,
    /// Property flag marking the return value
    pub return_param: u64,
    /// Property flag marking an optional parameter
    pub optional_param: u64,
}

impl Default for FlagBits {
    fn default() -> Self {
        Self {
            function_native: 0x400,
            param: 0x80,
            out_param: 0x100,
            return_param: 0x400,
            optional_param: 0x10,
        }
    }
}

/// Names of the core types, matched against object names
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TypeNames {
    /// The type-of-types
    pub class: String,
    /// Root of every type descriptor
    pub structure: String,
    /// Outermost container objects
    pub package: String,
    /// Function descriptors
    pub function: String,
}

impl Default for TypeNames {
    fn default() -> Self {
        Self {
            class: "Class".to_string(),
            structure: "Struct".to_string(),
            package: "Package".to_string(),
            function: "Function".to_string(),
        }
    }
}

/// Vtable slots of the host allocator object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocatorLayout {
    /// `Malloc(size, alignment)`
    pub malloc: usize,
    /// `Realloc(ptr, size, alignment)`
    pub realloc: usize,
    /// `Free(ptr)`
    pub free: usize,
}

/// A named scan pattern
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternSpec {
    /// Pattern text, e.g. `"48 8B 05 ?? ?? ?? ??"`
    pub pattern: String,

    /// Value to read at the match, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture: Option<CaptureSpec>,
}

/// Capture description of a named pattern
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureSpec {
    /// Offset of the captured field from the match start
    pub offset: isize,
    /// Width of the captured field (4 or 8)
    #[serde(default = "default_capture_width")]
    pub width: usize,
    /// Whether the field is an instruction-relative displacement
    #[serde(default)]
    pub relative: bool,
}

impl PatternSpec {
    /// Compile into a scan pattern
    pub fn compile(&self) -> Result<Pattern, crate::scan::PatternError> {
        let pattern = Pattern::parse(&self.pattern)?;
        match &self.capture {
            Some(c) => pattern.with_capture(c.offset, c.width, c.relative),
            None => Ok(pattern),
        }
    }
}

/// Complete layout description of one host build
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutProfile {
    /// Human-readable build name
    pub name: String,

    /// Pointer width of the host in bytes
    #[serde(default = "default_pointer_width")]
    pub pointer_width: usize,

    /// Calling convention of the host entry points
    #[serde(default)]
    pub calling_convention: CallingConvention,

    /// Name table
    pub names: NameTableLayout,

    /// Object table
    pub objects: ObjectTableLayout,

    /// Common object offsets
    pub object: ObjectLayout,

    /// Field descriptor offsets
    pub field: FieldLayout,

    /// Struct descriptor offsets
    #[serde(rename = "struct")]
    pub structure: StructLayout,

    /// Class descriptor offsets
    pub class: ClassLayout,

    /// Property descriptor offsets
    pub property: PropertyLayout,

    /// Function descriptor offsets
    pub function: FunctionLayout,

    /// Interpreter frame offsets
    pub frame: FrameLayout,

    /// Host strings
    #[serde(default)]
    pub strings: StringLayout,

    /// Flag bits
    #[serde(default)]
    pub flags: FlagBits,

    /// Core type names
    #[serde(default)]
    pub type_names: TypeNames,

    /// Host allocator vtable, when the host allocator is used
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocator: Option<AllocatorLayout>,

    /// Named scan patterns
    #[serde(default)]
    pub patterns: BTreeMap<String, PatternSpec>,
}

fn default_true() -> bool {
    true
}

fn default_wide_mask() -> u32 {
    1
}

fn default_max_name_len() -> usize {
    1024
}

fn default_end_of_params() -> u8 {
    0x16
}

fn default_char_width() -> usize {
    2
}

fn default_pointer_width() -> usize {
    8
}

fn default_capture_width() -> usize {
    4
}

impl LayoutProfile {
    /// Load a profile from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ProfileError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Parse a profile from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, ProfileError> {
        let profile: LayoutProfile = toml::from_str(content)?;
        profile.validate()?;
        Ok(profile)
    }

    /// Check internal consistency of the profile
    pub fn validate(&self) -> Result<(), ProfileError> {
        if self.name.is_empty() {
            return Err(invalid("Profile name cannot be empty"));
        }

        if self.pointer_width != 4 && self.pointer_width != 8 {
            return Err(invalid(format!(
                "Invalid pointer width: {}. Must be 4 or 8",
                self.pointer_width
            )));
        }

        validate_table("names", &self.names.table)?;
        validate_table("objects", &self.objects.table)?;

        if self.names.table.stride < self.pointer_width {
            return Err(invalid(format!(
                "Name table stride {} is smaller than a pointer",
                self.names.table.stride
            )));
        }

        if self.strings.char_width != 1 && self.strings.char_width != 2 {
            return Err(invalid(format!(
                "Invalid string char width: {}. Must be 1 or 2",
                self.strings.char_width
            )));
        }

        if self.names.entry.max_len == 0 {
            return Err(invalid("Name entry max_len must be positive"));
        }

        if self.class.interface.stride == 0 {
            return Err(invalid("Interface record stride must be positive"));
        }

        if self.flags.function_native == 0 || self.flags.param == 0 || self.flags.return_param == 0
        {
            return Err(invalid("Function native, param and return flags must be non-zero"));
        }

        let names = &self.type_names;
        for (what, value) in [
            ("class", &names.class),
            ("structure", &names.structure),
            ("package", &names.package),
            ("function", &names.function),
        ] {
            if value.is_empty() {
                return Err(invalid(format!("Type name '{}' cannot be empty", what)));
            }
        }

        if let Some(alloc) = &self.allocator {
            if alloc.malloc == alloc.free || alloc.realloc == alloc.free {
                return Err(invalid("Allocator vtable slots must be distinct"));
            }
        }

        for (name, spec) in &self.patterns {
            spec.compile()
                .map_err(|e| invalid(format!("Pattern '{}': {}", name, e)))?;
        }

        Ok(())
    }

    /// Check that the profile describes the running process
    ///
    /// A profile can be validated anywhere, but only used by a [`crate::Host`]
    /// when its pointer width and calling convention match the current target.
    pub fn check_native(&self) -> Result<(), ProfileError> {
        let native = std::mem::size_of::<usize>();
        if self.pointer_width != native {
            return Err(invalid(format!(
                "Profile pointer width {} does not match the process ({})",
                self.pointer_width, native
            )));
        }

        let expected = if cfg!(all(windows, target_arch = "x86")) {
            CallingConvention::Thiscall
        } else {
            CallingConvention::Native
        };
        if self.calling_convention != expected {
            return Err(invalid(format!(
                "Profile calling convention {:?} does not match the process ({:?})",
                self.calling_convention, expected
            )));
        }

        Ok(())
    }

    /// Serialize back to TOML
    pub fn to_toml(&self) -> Result<String, ProfileError> {
        toml::to_string_pretty(self).map_err(|e| invalid(e.to_string()))
    }
}

fn validate_table(which: &str, table: &TableLayout) -> Result<(), ProfileError> {
    if table.stride == 0 {
        return Err(invalid(format!("Table '{}' has zero stride", which)));
    }
    if table.chunk_size == Some(0) {
        return Err(invalid(format!("Table '{}' has zero chunk size", which)));
    }
    Ok(())
}

fn invalid(msg: impl Into<String>) -> ProfileError {
    ProfileError::Validation(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
name = "minimal"

[names.table]
count_offset = 0x8
stride = 8
chunk_size = 16384

[names.entry]
flags_offset = 0
text_offset = 0x10

[objects.table]
data_offset = 0x10
count_offset = 0x1C
stride = 0x18
chunk_size = 65536

[objects.item]
flags_offset = 8
dead_mask = 0x30000000

[object]
flags = 0x08
internal_index = 0x0C
class = 0x10
name = 0x18
outer = 0x20

[field]
next = 0x28

[struct]
super_struct = 0x30
children = 0x38
properties_size = 0x40
min_alignment = 0x44

[class]
interfaces = 0x68
interface = { class = 0, pointer_offset = 8, implemented_natively = 0xC, stride = 0x10 }

[property]
array_dim = 0x30
element_size = 0x34
property_flags = 0x38
offset = 0x44
bool = { mode = "byte", byte_offset = 0x71, field_mask = 0x73 }
inner = 0x70
struct_type = 0x70
property_class = 0x70
meta_class = 0x78
interface_class = 0x70

[function]
function_flags = 0x58

[frame]
node = 0x10
object = 0x18
code = 0x20

[patterns.objects]
pattern = "48 8B 05 ?? ?? ?? ?? 48 8B 0C C8"
capture = { offset = 3, relative = true }
"#;

    #[test]
    fn test_parse_minimal_profile() {
        let profile = LayoutProfile::from_str(MINIMAL).unwrap();
        assert_eq!(profile.name, "minimal");
        assert_eq!(profile.pointer_width, 8);
        assert_eq!(profile.names.table.chunk_size, Some(16384));
        assert!(profile.names.table.data_is_pointer);
        assert_eq!(profile.objects.item.dead_mask, 0x3000_0000);
        assert_eq!(profile.frame.end_of_params, 0x16);
        assert_eq!(profile.strings.char_width, 2);
        assert_eq!(profile.flags.function_native, 0x400);
        assert_eq!(profile.type_names.class, "Class");
        assert_eq!(
            profile.property.bool,
            BoolLayout::Byte {
                byte_offset: 0x71,
                field_mask: 0x73
            }
        );
        let capture = profile.patterns["objects"].capture.as_ref().unwrap();
        assert_eq!(capture.width, 4);
        assert!(capture.relative);
    }

    #[test]
    fn test_reject_bad_pointer_width() {
        let content = MINIMAL.replace("name = \"minimal\"", "name = \"minimal\"\npointer_width = 6");
        let err = LayoutProfile::from_str(&content).unwrap_err();
        assert!(matches!(err, ProfileError::Validation(_)));
    }

    #[test]
    fn test_reject_zero_chunk_size() {
        let content = MINIMAL.replace("chunk_size = 16384", "chunk_size = 0");
        assert!(LayoutProfile::from_str(&content).is_err());
    }

    #[test]
    fn test_reject_malformed_pattern() {
        let content = MINIMAL.replace("48 8B 0C C8", "48 8B 0C ZZ");
        let err = LayoutProfile::from_str(&content).unwrap_err();
        assert!(err.to_string().contains("objects"));
    }

    #[test]
    fn test_reject_bad_char_width() {
        let content = format!("{}\n[strings]\nchar_width = 4\n", MINIMAL);
        assert!(LayoutProfile::from_str(&content).is_err());
    }

    #[test]
    fn test_parse_error_surfaces() {
        let err = LayoutProfile::from_str("name = ").unwrap_err();
        assert!(matches!(err, ProfileError::Parse(_)));
    }

    #[test]
    fn test_roundtrip_through_toml() {
        let profile = LayoutProfile::from_str(MINIMAL).unwrap();
        let text = profile.to_toml().unwrap();
        let reparsed = LayoutProfile::from_str(&text).unwrap();
        assert_eq!(profile, reparsed);
    }

    #[test]
    fn test_thiscall_only_native_on_win32() {
        let content = MINIMAL.replace(
            "name = \"minimal\"",
            "name = \"minimal\"\ncalling_convention = \"thiscall\"",
        );
        let profile = LayoutProfile::from_str(&content).unwrap();
        // 64-bit thiscall never matches: wrong width on win32, wrong target elsewhere
        assert!(profile.check_native().is_err());
    }
}
