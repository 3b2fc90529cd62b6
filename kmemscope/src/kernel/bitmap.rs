use crate::domain::AccessError;
use crate::memory::Reader;

/// Read a bitmap of `nbits` bits stored as an array of `unsigned long`
///
/// # Errors
/// Returns `UnreadableMemory` if the array is not backed
pub fn read_bitmap(reader: &Reader<'_>, addr: u64, nbits: u32) -> Result<Vec<u64>, AccessError> {
    let word_bits = reader.arch().bits_per_long();
    let words = nbits.div_ceil(word_bits);
    (0..u64::from(words))
        .map(|i| reader.read_uint(addr + i * reader.pointer_size(), 0))
        .collect()
}

/// Indices of set bits, lowest first, limited to the first `nbits` bits
pub fn for_each_set_bit(words: &[u64], word_bits: u32, nbits: u32) -> impl Iterator<Item = u32> + '_ {
    words.iter().enumerate().flat_map(move |(idx, &word)| {
        #[allow(clippy::cast_possible_truncation)]
        let base = idx as u32 * word_bits;
        (0..word_bits)
            .filter(move |bit| word & (1u64 << bit) != 0)
            .map(move |bit| base + bit)
            .filter(move |&index| index < nbits)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{ArchInfo, SparseImage};

    #[test]
    fn test_for_each_set_bit() {
        let words = [0b1011u64, 1 << 63];
        let bits: Vec<u32> = for_each_set_bit(&words, 64, 128).collect();
        assert_eq!(bits, vec![0, 1, 3, 127]);

        let bits: Vec<u32> = for_each_set_bit(&words, 64, 2).collect();
        assert_eq!(bits, vec![0, 1]);
    }

    #[test]
    fn test_read_bitmap() {
        let mut img = SparseImage::new(ArchInfo::x86_64());
        img.map(0x1000, 0x100);
        img.write_u64(0x1000, 0x5).unwrap();
        img.write_u64(0x1008, 0x1).unwrap();
        let reader = Reader::new(&img);

        let words = read_bitmap(&reader, 0x1000, 65).unwrap();
        assert_eq!(words.len(), 2);
        let bits: Vec<u32> = for_each_set_bit(&words, 64, 65).collect();
        assert_eq!(bits, vec![0, 2, 64]);
    }
}
