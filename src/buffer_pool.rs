use tokio::sync::Mutex;

/// Splice copy buffer size; two of these are live per session.
pub const BUFFER_SIZE: usize = 16 * 1024;

const MAX_POOL_SIZE: usize = 256;

/// Pool of splice buffers so busy listeners do not reallocate two copy
/// buffers per accepted connection.
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            buffers: Mutex::new(Vec::with_capacity(MAX_POOL_SIZE)),
        }
    }

    /// Get a buffer from the pool or allocate a fresh one
    pub async fn get(&self) -> Vec<u8> {
        let mut pool = self.buffers.lock().await;
        match pool.pop() {
            Some(buffer) => {
                debug_assert_eq!(buffer.len(), BUFFER_SIZE);
                buffer
            }
            None => vec![0u8; BUFFER_SIZE],
        }
    }

    /// Return a buffer for reuse; wrong-sized buffers are discarded
    pub async fn put(&self, mut buffer: Vec<u8>) {
        if buffer.capacity() < BUFFER_SIZE || buffer.capacity() > BUFFER_SIZE * 2 {
            return;
        }
        // Zero on return to avoid leaking payload bytes between sessions
        buffer.clear();
        buffer.resize(BUFFER_SIZE, 0);

        let mut pool = self.buffers.lock().await;
        if pool.len() < MAX_POOL_SIZE {
            pool.push(buffer);
        }
    }

    pub async fn available(&self) -> usize {
        self.buffers.lock().await.len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Global buffer pool instance
static BUFFER_POOL: std::sync::OnceLock<BufferPool> = std::sync::OnceLock::new();

fn global_pool() -> &'static BufferPool {
    BUFFER_POOL.get_or_init(BufferPool::new)
}

pub async fn get_buffer() -> Vec<u8> {
    global_pool().get().await
}

pub async fn return_buffer(buffer: Vec<u8>) {
    global_pool().put(buffer).await;
}
