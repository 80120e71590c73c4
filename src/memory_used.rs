//! Tools for measuring the size of a data structure.
use std::mem::size_of;

use crate::cities::City;

/// Measure the memory size of a data structure.
pub trait MemoryUsed: Sized {
    /// Measure the memory size of a data structure, including itself.
    fn memory_used(&self) -> usize {
        self.memory_owned() + size_of::<Self>()
    }

    /// Measured the memory size of everything owned by a data structure, but
    /// not the structure itself.
    fn memory_owned(&self) -> usize {
        0
    }
}

impl<T> MemoryUsed for Vec<T>
where
    T: MemoryUsed,
{
    fn memory_owned(&self) -> usize {
        let item_mem = self.iter().map(|item| item.memory_owned()).sum::<usize>();
        let capacity_mem = self.capacity() * size_of::<T>();
        item_mem + capacity_mem
    }
}

impl MemoryUsed for String {
    fn memory_owned(&self) -> usize {
        self.capacity()
    }
}

impl MemoryUsed for City {
    fn memory_owned(&self) -> usize {
        // Our country code and coordinates are stored inline.
        self.name.memory_owned()
    }
}

#[test]
fn city_memory_includes_name() {
    let berlin = crate::cities::city("Berlin", "DE", 52.52, 13.405);
    assert_eq!(berlin.memory_used(), size_of::<City>() + berlin.name.capacity());
}

#[test]
fn vec_memory_includes_spare_capacity() {
    let mut names: Vec<String> = Vec::with_capacity(4);
    names.push("abc".to_owned());
    assert_eq!(
        names.memory_owned(),
        4 * size_of::<String>() + names[0].capacity()
    );
}
