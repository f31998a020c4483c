//! Grow-on-demand bit set that publishes newly-set indices to subscribers.
//!
//! Subscribers receive one decimal index per line: first every bit that was
//! already set when they joined (via the group's populate callback), then
//! each bit as it is newly set. Bits are never cleared while the owning
//! image is open.

use crate::util::stream::{Stream, StreamGroup};
use std::sync::{Arc, Mutex};

pub struct Bitmap {
    state: Arc<Mutex<BitArray>>,
    group: StreamGroup,
}

#[derive(Default)]
struct BitArray {
    bytes: Vec<u8>,
}

impl BitArray {
    fn test(&self, bit: u64) -> bool {
        let byte = (bit / 8) as usize;
        match self.bytes.get(byte) {
            Some(b) => b & (1 << (bit % 8)) != 0,
            None => false,
        }
    }

    /// Returns true iff this call flipped the bit from 0 to 1.
    fn set(&mut self, bit: u64) -> bool {
        let byte = (bit / 8) as usize;
        if byte >= self.bytes.len() {
            // Storage grows to the next power of two bytes.
            self.bytes.resize((byte + 1).next_power_of_two(), 0);
        }
        let mask = 1 << (bit % 8);
        let newly = self.bytes[byte] & mask == 0;
        self.bytes[byte] |= mask;
        newly
    }

    fn iter_set(&self) -> impl Iterator<Item = u64> + '_ {
        self.bytes.iter().enumerate().flat_map(|(byte, &b)| {
            (0..8)
                .filter(move |shift| b & (1 << shift) != 0)
                .map(move |shift| byte as u64 * 8 + shift)
        })
    }
}

impl Bitmap {
    pub fn new() -> Self {
        let state = Arc::new(Mutex::new(BitArray::default()));
        let populate_state = state.clone();
        let group = StreamGroup::with_populate(move |strm: &Stream| {
            let bits = populate_state.lock().unwrap();
            for bit in bits.iter_set() {
                strm.write(&format!("{bit}\n"));
            }
        });
        Self { state, group }
    }

    /// Idempotent add. The newly-set event is emitted after the bit lock is
    /// released, and only when the bit actually flipped.
    pub fn set(&self, bit: u64) -> bool {
        let newly = self.state.lock().unwrap().set(bit);
        if newly {
            self.group.write(&format!("{bit}\n"));
        }
        newly
    }

    pub fn test(&self, bit: u64) -> bool {
        self.state.lock().unwrap().test(bit)
    }

    /// Open a subscriber: current contents first, then live additions.
    pub fn subscribe(&self) -> Stream {
        self.group.subscribe()
    }

    pub fn group(&self) -> &StreamGroup {
        &self.group
    }
}

impl Default for Bitmap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::cancel::Interrupt;

    #[test]
    fn test_set_and_test() {
        let map = Bitmap::new();
        assert!(!map.test(0));
        assert!(map.set(0));
        assert!(map.test(0));
        assert!(!map.set(0), "second set must not report newly-set");
    }

    #[test]
    fn test_grows_on_demand() {
        let map = Bitmap::new();
        map.set(100_000);
        assert!(map.test(100_000));
        assert!(!map.test(99_999));
    }

    #[tokio::test]
    async fn test_subscriber_sees_history_then_live() {
        let map = Bitmap::new();
        map.set(3);
        map.set(17);
        let strm = map.subscribe();
        map.set(4096);
        let intr = Interrupt::new();
        let got = strm.read(1024, false, &intr).await.unwrap();
        assert_eq!(String::from_utf8(got).unwrap(), "3\n17\n4096\n");
    }

    #[tokio::test]
    async fn test_concurrent_set_and_subscribe_no_duplicates() {
        let map = Arc::new(Bitmap::new());
        let writer = {
            let map = map.clone();
            tokio::spawn(async move {
                for bit in 0..512 {
                    map.set(bit);
                    if bit % 64 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            })
        };
        tokio::task::yield_now().await;
        // Joins mid-write: some bits arrive via the populate snapshot, the
        // rest live. Each must arrive exactly once.
        let strm = map.subscribe();
        writer.await.unwrap();

        let intr = Interrupt::new();
        let mut text = String::new();
        loop {
            match strm.read(4096, false, &intr).await {
                Ok(chunk) if !chunk.is_empty() => {
                    text.push_str(std::str::from_utf8(&chunk).unwrap());
                }
                _ => break,
            }
        }
        let mut seen = std::collections::HashSet::new();
        for line in text.lines() {
            let bit: u64 = line.parse().unwrap();
            assert!(seen.insert(bit), "bit {bit} delivered twice");
        }
        assert_eq!(seen.len(), 512);
    }

    #[tokio::test]
    async fn test_redundant_set_emits_nothing() {
        let map = Bitmap::new();
        map.set(9);
        let strm = map.subscribe();
        map.set(9);
        let intr = Interrupt::new();
        let got = strm.read(1024, false, &intr).await.unwrap();
        assert_eq!(String::from_utf8(got).unwrap(), "9\n");
    }
}
