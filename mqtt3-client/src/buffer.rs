/// Default size of the read and write buffers.
pub const BUF_DEFAULT_SIZE: usize = 1024;
/// Smallest legal buffer size.
pub const BUF_MIN_SIZE: usize = 2;
/// Largest legal buffer size, MQTT's remaining-length ceiling.
pub const BUF_MAX_SIZE: usize = 268_435_455;

/// An owned, fixed-capacity packet buffer.
///
/// One instance backs the read side and one the write side of a session.
/// Resizing reallocates; sizes outside the legal range fall back to the
/// default instead of failing.
#[derive(Debug)]
pub struct PacketBuffer {
    data: Vec<u8>,
}

impl PacketBuffer {
    pub fn new(size: usize) -> Self {
        PacketBuffer {
            data: vec![0; clamp_size(size)],
        }
    }

    /// Replaces the buffer with a freshly allocated one of `size` bytes.
    pub fn resize(&mut self, size: usize) -> usize {
        self.data = vec![0; clamp_size(size)];
        self.data.len()
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Default for PacketBuffer {
    fn default() -> Self {
        PacketBuffer::new(BUF_DEFAULT_SIZE)
    }
}

fn clamp_size(size: usize) -> usize {
    if size < BUF_MIN_SIZE || size > BUF_MAX_SIZE {
        BUF_DEFAULT_SIZE
    } else {
        size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_size() {
        assert_eq!(PacketBuffer::default().capacity(), BUF_DEFAULT_SIZE);
    }

    #[test]
    fn test_clamping() {
        assert_eq!(PacketBuffer::new(0).capacity(), BUF_DEFAULT_SIZE);
        assert_eq!(PacketBuffer::new(1).capacity(), BUF_DEFAULT_SIZE);
        assert_eq!(PacketBuffer::new(BUF_MIN_SIZE).capacity(), BUF_MIN_SIZE);
        assert_eq!(PacketBuffer::new(4096).capacity(), 4096);
        assert_eq!(PacketBuffer::new(BUF_MAX_SIZE + 1).capacity(), BUF_DEFAULT_SIZE);
    }

    #[test]
    fn test_resize_reallocates() {
        let mut buf = PacketBuffer::default();
        buf.as_mut_slice()[0] = 0xAB;

        assert_eq!(buf.resize(64), 64);
        assert_eq!(buf.capacity(), 64);
        assert_eq!(buf.as_slice()[0], 0);

        assert_eq!(buf.resize(usize::max_value()), BUF_DEFAULT_SIZE);
    }
}
