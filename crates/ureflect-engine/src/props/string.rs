//! Host dynamic strings
//!
//! A host string is a dynamic array of characters whose count includes the
//! null terminator. An empty string has count 0 and may or may not own a
//! buffer.

use super::dynarray::{ArrayHeader, MAX_COUNT};
use super::{value_mismatch, KindOps, Slot, Value};
use crate::error::{ReflectError, ReflectResult};
use crate::host::Host;
use crate::memory;
use crate::types::Property;

pub(super) static STR: KindOps = KindOps {
    get: str_get,
    validate: str_validate,
    set: str_set,
    copy: str_copy,
    destroy: Some(str_destroy),
};

/// Encode into host characters, without terminator
fn encode(text: &str, char_width: usize) -> Vec<u16> {
    if char_width == 2 {
        text.encode_utf16().collect()
    } else {
        text.chars()
            .map(|c| if (c as u32) <= 0xFF { c as u16 } else { b'?' as u16 })
            .collect()
    }
}

fn encoded_len(text: &str, char_width: usize) -> usize {
    if char_width == 2 {
        text.encode_utf16().count()
    } else {
        text.chars().count()
    }
}

/// Read the host string whose header is at `addr`
pub(crate) fn read_string(host: &Host, addr: usize) -> String {
    let header = ArrayHeader::new(host, addr);
    let (data, count) = (header.data(), header.count());
    if data == 0 || count == 0 {
        return String::new();
    }
    let char_width = host.profile().strings.char_width;
    let mut text = unsafe { memory::read_chars(data, char_width, count) };
    // The count includes one terminator
    if text.ends_with('\0') {
        text.pop();
    }
    text
}

/// Write character `index` of a buffer of `char_width` characters
///
/// # Safety
/// The character must lie inside the buffer.
unsafe fn write_char(data: usize, index: usize, unit: u16, char_width: usize) {
    if char_width == 2 {
        memory::write::<u16>(data + index * 2, unit);
    } else {
        memory::write::<u8>(data + index, unit as u8);
    }
}

/// Overwrite the host string whose header is at `addr`
pub(crate) fn write_string(host: &Host, addr: usize, text: &str) -> ReflectResult<()> {
    let header = ArrayHeader::new(host, addr);
    let char_width = host.profile().strings.char_width;
    let units = encode(text, char_width);

    if units.is_empty() {
        if header.data() != 0 && header.capacity() > 0 {
            unsafe { write_char(header.data(), 0, 0, char_width) };
        }
        header.set_count(0);
        return Ok(());
    }

    let needed = units.len() + 1;
    header.reserve(host, needed, char_width, char_width)?;
    let data = header.data();
    unsafe {
        for (i, unit) in units.iter().enumerate() {
            write_char(data, i, *unit, char_width);
        }
        write_char(data, units.len(), 0, char_width);
    }
    header.set_count(needed);
    Ok(())
}

fn str_get(slot: &Slot<'_>) -> ReflectResult<Value> {
    Ok(Value::Str(read_string(slot.host, slot.addr)))
}

fn str_validate(host: &Host, prop: &Property, value: &Value) -> ReflectResult<()> {
    let text = value.as_str().ok_or_else(|| value_mismatch(prop, value))?;
    let needed = encoded_len(text, host.profile().strings.char_width) + 1;
    if needed > MAX_COUNT {
        return Err(ReflectError::Length {
            requested: needed,
            max: MAX_COUNT,
        });
    }
    Ok(())
}

fn str_set(slot: &Slot<'_>, value: &Value) -> ReflectResult<()> {
    let text = value
        .as_str()
        .ok_or_else(|| value_mismatch(slot.prop, value))?;
    write_string(slot.host, slot.addr, text)
}

fn str_copy(host: &Host, _prop: &Property, dst: usize, src: usize) -> ReflectResult<()> {
    let from = ArrayHeader::new(host, src);
    let to = ArrayHeader::new(host, dst);
    let count = from.count();
    if count == 0 || from.data() == 0 {
        return Ok(());
    }
    let char_width = host.profile().strings.char_width;
    to.reserve(host, count, char_width, char_width)?;
    unsafe { memory::copy(to.data(), from.data(), count * char_width) };
    to.set_count(count);
    Ok(())
}

fn str_destroy(host: &Host, _prop: &Property, addr: usize) {
    ArrayHeader::new(host, addr).release(host);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FailingAllocator, FakeHost, FieldSpec};
    use std::sync::Arc;

    #[test]
    fn test_string_roundtrip_and_terminator() {
        let mut fake = FakeHost::new();
        let actor = fake.class("Actor").field("Label", FieldSpec::Str).finish();
        let obj = fake.spawn(actor, "A", None);
        let host = fake.host();

        host.set_field(obj, "Label", &Value::from("héllo")).unwrap();
        assert_eq!(host.get_field(obj, "Label").unwrap().as_str(), Some("héllo"));

        let offset = host.find_field(actor, "Label").unwrap().offset;
        let header = ArrayHeader::new(host, obj.addr() + offset);
        assert_eq!(header.count(), 6);
        let terminator = unsafe { memory::read::<u16>(header.data() + 5 * 2) };
        assert_eq!(terminator, 0);
    }

    #[test]
    fn test_string_grows_and_shrinks() {
        let mut fake = FakeHost::new();
        let actor = fake.class("Actor").field("Label", FieldSpec::Str).finish();
        let obj = fake.spawn(actor, "A", None);
        let host = fake.host();

        host.set_field(obj, "Label", &Value::from("ab")).unwrap();
        let long = "x".repeat(300);
        host.set_field(obj, "Label", &Value::from(long.as_str())).unwrap();
        assert_eq!(host.get_field(obj, "Label").unwrap().as_str(), Some(long.as_str()));
        host.set_field(obj, "Label", &Value::from("c")).unwrap();
        assert_eq!(host.get_field(obj, "Label").unwrap().as_str(), Some("c"));
        host.set_field(obj, "Label", &Value::from("")).unwrap();
        assert_eq!(host.get_field(obj, "Label").unwrap().as_str(), Some(""));
    }

    #[test]
    fn test_empty_host_string_reads_empty() {
        let mut fake = FakeHost::new();
        let actor = fake.class("Actor").field("Label", FieldSpec::Str).finish();
        let obj = fake.spawn(actor, "A", None);
        assert_eq!(fake.host().get_field(obj, "Label").unwrap().as_str(), Some(""));
    }

    #[test]
    fn test_string_allocation_failure_leaves_old_value() {
        let mut fake = FakeHost::new();
        let actor = fake.class("Actor").field("Label", FieldSpec::Str).finish();
        let obj = fake.spawn(actor, "A", None);
        fake.host().set_field(obj, "Label", &Value::from("ok")).unwrap();

        let failing = fake.host_with_allocator(Arc::new(FailingAllocator));
        let err = failing
            .set_field(obj, "Label", &Value::from("much longer text"))
            .unwrap_err();
        assert!(matches!(err, ReflectError::Allocation { .. }));
        assert_eq!(failing.get_field(obj, "Label").unwrap().as_str(), Some("ok"));
    }

    #[test]
    fn test_string_at_exact_capacity_reuses_buffer() {
        let mut fake = FakeHost::new();
        let actor = fake.class("Actor").field("Label", FieldSpec::Str).finish();
        let obj = fake.spawn(actor, "A", None);
        let host = fake.host();
        let offset = host.find_field(actor, "Label").unwrap().offset;
        let header = ArrayHeader::new(host, obj.addr() + offset);

        host.set_field(obj, "Label", &Value::from("abcd")).unwrap();
        assert_eq!(header.capacity(), 5);
        let data = header.data();

        host.set_field(obj, "Label", &Value::from("wxyz")).unwrap();
        assert_eq!(host.get_field(obj, "Label").unwrap().as_str(), Some("wxyz"));
        assert_eq!(header.data(), data);
        assert_eq!(header.count(), 5);
        assert_eq!(header.capacity(), 5);
    }

    #[test]
    fn test_embedded_trailing_nul_survives() {
        let mut fake = FakeHost::new();
        let actor = fake.class("Actor").field("Label", FieldSpec::Str).finish();
        let obj = fake.spawn(actor, "A", None);
        let host = fake.host();

        host.set_field(obj, "Label", &Value::from("ab\0")).unwrap();
        assert_eq!(host.get_field(obj, "Label").unwrap().as_str(), Some("ab\0"));
        host.set_field(obj, "Label", &Value::from("\0")).unwrap();
        assert_eq!(host.get_field(obj, "Label").unwrap().as_str(), Some("\0"));
    }

    fn narrow_host(fake: &FakeHost) -> Host {
        let mut profile = FakeHost::profile();
        profile.strings.char_width = 1;
        Host::new(profile, fake.config()).unwrap()
    }

    #[test]
    fn test_narrow_empty_string_writes_one_byte_terminator() {
        let fake = FakeHost::new();
        let host = narrow_host(&fake);

        // Room for the terminator only, followed by a guard byte
        let mut chars = [b'a', 0xAA];
        let mut storage = [0u64; 2];
        let addr = storage.as_mut_ptr() as usize;
        unsafe {
            memory::write::<usize>(addr, chars.as_mut_ptr() as usize);
            memory::write::<i32>(addr + 8, 1);
            memory::write::<i32>(addr + 12, 1);
        }

        write_string(&host, addr, "").unwrap();
        let written = unsafe { memory::read::<[u8; 2]>(chars.as_ptr() as usize) };
        assert_eq!(written, [0, 0xAA]);
        assert_eq!(ArrayHeader::new(&host, addr).count(), 0);
        assert_eq!(read_string(&host, addr), "");
    }

    #[test]
    fn test_narrow_string_roundtrip() {
        let fake = FakeHost::new();
        let host = narrow_host(&fake);
        let mut storage = [0u64; 2];
        let addr = storage.as_mut_ptr() as usize;

        write_string(&host, addr, "héllo").unwrap();
        let header = ArrayHeader::new(&host, addr);
        assert_eq!(header.count(), 6);
        assert_eq!(unsafe { memory::read::<u8>(header.data() + 1) }, 0xE9);
        assert_eq!(unsafe { memory::read::<u8>(header.data() + 5) }, 0);
        assert_eq!(read_string(&host, addr), "héllo");
        header.release(&host);
    }

    #[test]
    fn test_narrow_encoding_replaces_wide_chars() {
        assert_eq!(encode("aé€", 1), vec![b'a' as u16, 0xE9, b'?' as u16]);
        assert_eq!(encoded_len("a€", 2), 2);
    }
}
