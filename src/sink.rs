//! Byte-budgeted destination for captured samples.
//!
//! The streaming thread hands buffers to [`SampleSink::on_samples`], which
//! queues at most `budget` bytes to a writer thread. A full queue blocks the
//! streaming thread; the board then reports overflows, which the supervisor
//! treats as fatal.

use std::{
    fmt,
    fs::File,
    io::{self, BufWriter, Write},
    path::PathBuf,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU8, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
};

use crossbeam_channel::{Receiver, Sender, bounded};
use log::{error, info};

use crate::{device::SampleHandler, lock};

const QUEUE_DEPTH: usize = 64;
const WRITE_BUFFER: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    File(PathBuf),
    Stdout,
}

impl From<&str> for Destination {
    fn from(s: &str) -> Self {
        if s == "stdout" {
            Destination::Stdout
        } else {
            Destination::File(PathBuf::from(s))
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::File(path) => write!(f, "'{}'", path.display()),
            Destination::Stdout => write!(f, "standard output"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SinkStatus {
    Running = 0,
    Done = 1,
    Error = 2,
}

impl SinkStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SinkStatus::Running,
            1 => SinkStatus::Done,
            _ => SinkStatus::Error,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("cannot open {destination}: {source}")]
    Open {
        destination: Destination,
        #[source]
        source: io::Error,
    },

    #[error("cannot start writer thread: {0}")]
    Spawn(#[source] io::Error),
}

#[derive(Default)]
struct Shared {
    status: AtomicU8,
    written: AtomicU64,
}

impl Shared {
    fn finish(&self, status: SinkStatus) {
        let _ = self.status.compare_exchange(
            SinkStatus::Running as u8,
            status as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

pub struct SampleSink {
    budget: u64,
    unqueued: AtomicU64,
    shared: Arc<Shared>,
    sender: Mutex<Option<Sender<Vec<u8>>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl SampleSink {
    pub fn create(destination: &Destination, budget: u64) -> Result<Self, SinkError> {
        let out: Box<dyn Write + Send> = match destination {
            Destination::File(path) => Box::new(File::create(path).map_err(|source| SinkError::Open {
                destination: destination.clone(),
                source,
            })?),
            Destination::Stdout => Box::new(io::stdout()),
        };
        Self::from_writer(out, budget)
    }

    pub fn from_writer<W: Write + Send + 'static>(out: W, budget: u64) -> Result<Self, SinkError> {
        let (sender, receiver) = bounded(QUEUE_DEPTH);
        let shared = Arc::new(Shared::default());
        let writer_shared = shared.clone();
        let writer = thread::Builder::new()
            .name("sample-sink".to_string())
            .spawn(move || {
                write_loop(
                    BufWriter::with_capacity(WRITE_BUFFER, out),
                    receiver,
                    &writer_shared,
                    budget,
                )
            })
            .map_err(SinkError::Spawn)?;

        Ok(SampleSink {
            budget,
            unqueued: AtomicU64::new(budget),
            shared,
            sender: Mutex::new(Some(sender)),
            writer: Mutex::new(Some(writer)),
        })
    }

    pub fn status(&self) -> SinkStatus {
        SinkStatus::from_u8(self.shared.status.load(Ordering::Acquire))
    }

    pub fn bytes_remaining(&self) -> u64 {
        self.budget
            .saturating_sub(self.shared.written.load(Ordering::Acquire))
    }

    /// Stop accepting data, drain the queue and wait for the writer. Idempotent.
    pub fn close(&self) {
        drop(lock(&self.sender).take());
        if let Some(writer) = lock(&self.writer).take() {
            if writer.join().is_err() {
                error!("sample writer thread panicked");
                self.shared.finish(SinkStatus::Error);
            }
        }
    }
}

impl fmt::Debug for SampleSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SampleSink")
            .field("budget", &self.budget)
            .field("status", &self.status())
            .finish()
    }
}

impl SampleHandler for SampleSink {
    fn on_samples(&self, data: &[u8]) {
        if self.status() != SinkStatus::Running {
            return;
        }
        let want = data.len() as u64;
        let Ok(left) = self
            .unqueued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| {
                (left > 0).then(|| left - left.min(want))
            })
        else {
            return;
        };
        let take = left.min(want) as usize;

        let sender = lock(&self.sender);
        if let Some(sender) = sender.as_ref() {
            // The writer only hangs up after it stopped, and it sets the status first.
            let _ = sender.send(data[..take].to_vec());
        }
    }
}

impl Drop for SampleSink {
    fn drop(&mut self) {
        self.close();
    }
}

fn write_loop<W: Write>(mut out: BufWriter<W>, receiver: Receiver<Vec<u8>>, shared: &Shared, budget: u64) {
    let mut written = 0u64;
    if budget > 0 {
        for chunk in receiver.iter() {
            if let Err(e) = out.write_all(&chunk) {
                error!("sample write failed: {e}");
                shared.finish(SinkStatus::Error);
                return;
            }
            written += chunk.len() as u64;
            if written >= budget {
                break;
            }
            shared.written.store(written, Ordering::Release);
        }
    }

    if let Err(e) = out.flush() {
        error!("sample flush failed: {e}");
        shared.finish(SinkStatus::Error);
        return;
    }
    shared.written.store(written, Ordering::Release);
    if written >= budget {
        info!("byte budget of {budget} bytes written");
        shared.finish(SinkStatus::Done);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        thread::sleep,
        time::{Duration, Instant},
    };

    fn wait_for(sink: &SampleSink, status: SinkStatus) {
        let start = Instant::now();
        while sink.status() != status {
            assert!(start.elapsed() < Duration::from_secs(5), "sink stuck in {:?}", sink.status());
            sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn stops_exactly_at_budget() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.bin");
        let sink = SampleSink::create(&Destination::File(path.clone()), 10).unwrap();

        sink.on_samples(&[1, 2, 3, 4]);
        sink.on_samples(&[5, 6, 7, 8]);
        sink.on_samples(&[9, 10, 11, 12]);
        sink.on_samples(&[13]);
        wait_for(&sink, SinkStatus::Done);

        assert_eq!(sink.bytes_remaining(), 0);
        sink.close();
        assert_eq!(std::fs::read(path).unwrap(), (1..=10).collect::<Vec<u8>>());
    }

    #[test]
    fn closing_early_keeps_running_status() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.bin");
        let sink = SampleSink::create(&Destination::File(path.clone()), 1000).unwrap();
        sink.on_samples(&[0xaa; 100]);
        sink.close();
        sink.close();

        assert_eq!(sink.status(), SinkStatus::Running);
        assert_eq!(sink.bytes_remaining(), 900);
        assert_eq!(std::fs::read(path).unwrap().len(), 100);
    }

    struct Broken;

    impl Write for Broken {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::other("disk full"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Err(io::Error::other("disk full"))
        }
    }

    #[test]
    fn write_failure_reports_error() {
        // Larger than the internal buffer so the write reaches the writer.
        let sink = SampleSink::from_writer(Broken, 1 << 30).unwrap();
        sink.on_samples(&vec![0u8; WRITE_BUFFER + 1]);
        wait_for(&sink, SinkStatus::Error);
        sink.on_samples(&[1, 2, 3]);
        sink.close();
        assert_eq!(sink.status(), SinkStatus::Error);
    }

    #[test]
    fn destination_from_argument() {
        assert_eq!(Destination::from("stdout"), Destination::Stdout);
        assert_eq!(Destination::from("dump.bin"), Destination::File(PathBuf::from("dump.bin")));
    }
}
