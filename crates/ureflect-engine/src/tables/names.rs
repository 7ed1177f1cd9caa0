//! Interned name table

use std::fmt;

use super::TableView;
use crate::error::{ReflectError, ReflectResult};
use crate::layout::{NameEntryLayout, NameTableLayout};
use crate::memory;

/// Identifier of an interned name plus an instance number
///
/// `number == 0` means "no suffix"; otherwise the display form is
/// `<text>_<number - 1>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FName {
    /// Index into the name table
    pub index: i32,
    /// Instance number
    pub number: u32,
}

impl FName {
    /// Create a name identifier
    pub const fn new(index: i32, number: u32) -> Self {
        Self { index, number }
    }

    /// Display form given the entry text
    pub fn display(&self, text: &str) -> String {
        if self.number > 0 {
            format!("{}_{}", text, self.number - 1)
        } else {
            text.to_string()
        }
    }
}

impl fmt::Display for FName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FName({}, {})", self.index, self.number)
    }
}

/// A name table entry, copied out of host memory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameEntry {
    /// Slot index
    pub index: usize,
    /// Whether the host stores the text as wide characters
    pub is_wide: bool,
    /// Entry text
    pub text: String,
}

/// View over the host's interned name table
#[derive(Debug, Clone)]
pub struct NameTable {
    table: TableView,
    entry: NameEntryLayout,
}

impl NameTable {
    /// Create a view over the name table at `base`
    pub fn new(base: usize, layout: &NameTableLayout, pointer_width: usize) -> ReflectResult<Self> {
        Ok(Self {
            table: TableView::new(base, layout.table.clone(), pointer_width)?,
            entry: layout.entry.clone(),
        })
    }

    /// Number of slots
    pub fn size(&self) -> usize {
        self.table.len()
    }

    /// Entry at `index`; `None` for an empty slot
    pub fn at(&self, index: usize) -> ReflectResult<Option<NameEntry>> {
        let slot = self.table.element_addr(index)?;
        let entry = unsafe { memory::read_ptr(slot) };
        if entry == 0 {
            return Ok(None);
        }

        let flags = unsafe { memory::read::<u32>(entry + self.entry.flags_offset) };
        let is_wide = flags & self.entry.wide_mask != 0;
        let char_width = if is_wide { 2 } else { 1 };
        let text = unsafe {
            memory::read_c_string(entry + self.entry.text_offset, char_width, self.entry.max_len)
        };

        Ok(Some(NameEntry {
            index,
            is_wide,
            text,
        }))
    }

    /// Text of the entry at `index`; an empty slot is an invalid entry
    pub fn text(&self, index: i32) -> ReflectResult<String> {
        let slot = usize::try_from(index).map_err(|_| ReflectError::OutOfBounds {
            index: index as usize,
            size: self.size(),
        })?;
        match self.at(slot)? {
            Some(entry) => Ok(entry.text),
            None => Err(ReflectError::InvalidEntry {
                index: slot,
                reason: "name slot is empty".to_string(),
            }),
        }
    }

    /// Display form of a name identifier
    pub fn resolve(&self, name: FName) -> ReflectResult<String> {
        Ok(name.display(&self.text(name.index)?))
    }

    /// Index of the first entry whose text equals `text`
    pub fn find(&self, text: &str) -> Option<usize> {
        (0..self.size()).find(|&index| {
            matches!(self.at(index), Ok(Some(entry)) if entry.text == text)
        })
    }

    /// All readable entries, in slot order
    pub fn entries(&self) -> impl Iterator<Item = NameEntry> + '_ {
        (0..self.size()).filter_map(move |index| self.at(index).ok().flatten())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeHost;

    #[test]
    fn test_fname_display() {
        assert_eq!(FName::new(1, 0).display("Actor"), "Actor");
        assert_eq!(FName::new(1, 1).display("Actor"), "Actor_0");
        assert_eq!(FName::new(1, 8).display("Actor"), "Actor_7");
    }

    #[test]
    fn test_lookup_and_reverse_lookup() {
        let mut fake = FakeHost::new();
        let index = fake.intern("PlayerController");
        let names = fake.host().names();

        let entry = names.at(index as usize).unwrap().unwrap();
        assert_eq!(entry.text, "PlayerController");
        assert!(!entry.is_wide);
        assert_eq!(names.find("PlayerController"), Some(index as usize));
        assert_eq!(names.find("NoSuchName"), None);
    }

    #[test]
    fn test_wide_entry() {
        let mut fake = FakeHost::new();
        let index = fake.intern_wide("Größe");
        let entry = fake.host().names().at(index as usize).unwrap().unwrap();
        assert!(entry.is_wide);
        assert_eq!(entry.text, "Größe");
    }

    #[test]
    fn test_empty_slot_and_bounds() {
        let mut fake = FakeHost::new();
        let hole = fake.reserve_name_slot();
        let names = fake.host().names();

        assert_eq!(names.at(hole as usize).unwrap(), None);
        assert!(names.text(hole).is_err());
        let size = names.size();
        assert!(matches!(
            names.at(size),
            Err(ReflectError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_resolve_numbered() {
        let mut fake = FakeHost::new();
        let index = fake.intern("Light");
        let names = fake.host().names();
        assert_eq!(names.resolve(FName::new(index, 5)).unwrap(), "Light_4");
    }
}
