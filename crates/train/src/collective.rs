//! Process-group collectives.
//!
//! The loop needs exactly three operations from the group: an all-reduce that
//! averages the flattened gradients, a barrier and an orderly shutdown.
//! [`SingleProcess`] is the identity for one worker; [`TcpCollective`] joins
//! `world_size` processes in a star around rank 0.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::error::TrainError;

/// Collective operations over a fixed group of processes.
pub trait Collective: Send + Sync {
    fn rank(&self) -> usize;
    fn world_size(&self) -> usize;

    /// Replace `values` with their element-wise mean across the group. Every
    /// rank observes the identical result.
    fn all_reduce_mean(&self, values: &mut [f32]) -> Result<(), TrainError>;

    fn barrier(&self) -> Result<(), TrainError>;

    /// Final barrier, then release the transport. Later calls fail.
    fn shutdown(&self) -> Result<(), TrainError>;
}

// ── SingleProcess ───────────────────────────────────────────────────────────

/// A group of one.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleProcess;

impl Collective for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_mean(&self, _values: &mut [f32]) -> Result<(), TrainError> {
        Ok(())
    }

    fn barrier(&self) -> Result<(), TrainError> {
        Ok(())
    }

    fn shutdown(&self) -> Result<(), TrainError> {
        Ok(())
    }
}

// ── TCP star ────────────────────────────────────────────────────────────────

const HELLO_MAGIC: u32 = 0x464F_5247; // "FORG"
const TAG_REDUCE: u8 = 1;
const TAG_BARRIER: u8 = 2;
const CONNECT_RETRY: Duration = Duration::from_millis(100);

enum Links {
    /// Rank 0: one stream per other rank, index `r - 1`.
    Hub(Vec<TcpStream>),
    Spoke(TcpStream),
    Closed,
}

/// Star-topology collective. Rank 0 accepts one connection per peer, sums
/// contributions in rank order and broadcasts the mean back.
pub struct TcpCollective {
    rank: usize,
    world_size: usize,
    links: Mutex<Links>,
}

fn io_err(context: &str, e: std::io::Error) -> TrainError {
    TrainError::Collective(format!("{context}: {e}"))
}

impl TcpCollective {
    /// Join the group. Rank 0 listens on `addr`, the others dial it; both sides
    /// give up after `timeout`.
    pub fn connect(rank: usize, world_size: usize, addr: SocketAddr, timeout: Duration) -> Result<Self, TrainError> {
        if rank == 0 {
            let listener = TcpListener::bind(addr).map_err(|e| io_err("binding master address", e))?;
            Self::hub(listener, world_size, timeout)
        } else {
            Self::spoke(rank, world_size, addr, timeout)
        }
    }

    /// Rank 0 on an already bound listener.
    pub fn hub(listener: TcpListener, world_size: usize, timeout: Duration) -> Result<Self, TrainError> {
        let deadline = Instant::now() + timeout;
        listener
            .set_nonblocking(true)
            .map_err(|e| io_err("configuring listener", e))?;

        let mut slots: Vec<Option<TcpStream>> = (1..world_size).map(|_| None).collect();
        let mut joined = 0;
        while joined < world_size - 1 {
            match listener.accept() {
                Ok((mut stream, peer)) => {
                    stream
                        .set_nonblocking(false)
                        .map_err(|e| io_err("configuring peer stream", e))?;
                    configure(&stream, Some(timeout))?;
                    let (magic, rank, world) = read_hello(&mut stream)?;
                    if magic != HELLO_MAGIC || world != world_size || rank == 0 || rank >= world_size {
                        return Err(TrainError::Collective(format!(
                            "bad hello from {peer}: rank {rank}, world {world}"
                        )));
                    }
                    if slots[rank - 1].is_some() {
                        return Err(TrainError::Collective(format!("rank {rank} joined twice")));
                    }
                    // The join deadline does not bound later collectives: peers
                    // wait in all-reduce while the master evaluates.
                    configure(&stream, None)?;
                    debug!("rank {rank} joined from {peer}");
                    slots[rank - 1] = Some(stream);
                    joined += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(TrainError::Collective(format!(
                            "only {joined} of {} peers joined before the timeout",
                            world_size - 1
                        )));
                    }
                    std::thread::sleep(CONNECT_RETRY);
                }
                Err(e) => return Err(io_err("accepting peer", e)),
            }
        }

        Ok(Self {
            rank: 0,
            world_size,
            links: Mutex::new(Links::Hub(slots.into_iter().flatten().collect())),
        })
    }

    /// Rank `rank > 0`, dialling the hub at `addr`.
    pub fn spoke(rank: usize, world_size: usize, addr: SocketAddr, timeout: Duration) -> Result<Self, TrainError> {
        let deadline = Instant::now() + timeout;
        let mut stream = loop {
            match TcpStream::connect(addr) {
                Ok(s) => break s,
                Err(e) if Instant::now() < deadline => {
                    debug!("rank {rank} waiting for master at {addr}: {e}");
                    std::thread::sleep(CONNECT_RETRY);
                }
                Err(e) => return Err(io_err("connecting to master", e)),
            }
        };
        configure(&stream, None)?;
        let mut hello = Vec::with_capacity(12);
        hello.extend_from_slice(&HELLO_MAGIC.to_le_bytes());
        hello.extend_from_slice(&(rank as u32).to_le_bytes());
        hello.extend_from_slice(&(world_size as u32).to_le_bytes());
        stream.write_all(&hello).map_err(|e| io_err("sending hello", e))?;

        Ok(Self {
            rank,
            world_size,
            links: Mutex::new(Links::Spoke(stream)),
        })
    }

    /// One round trip: every rank contributes `values`, every rank receives
    /// the rank-ordered sum divided by the world size.
    fn exchange(&self, tag: u8, values: &mut [f32]) -> Result<(), TrainError> {
        let mut links = self.links.lock();
        match &mut *links {
            Links::Closed => Err(TrainError::Collective("group already shut down".into())),
            Links::Spoke(stream) => {
                write_frame(stream, tag, values)?;
                let reply = read_frame(stream, tag)?;
                if reply.len() != values.len() {
                    return Err(TrainError::Collective(format!(
                        "reply has {} values, expected {}",
                        reply.len(),
                        values.len()
                    )));
                }
                values.copy_from_slice(&reply);
                Ok(())
            }
            Links::Hub(peers) => {
                let mut sum = values.to_vec();
                for (i, stream) in peers.iter_mut().enumerate() {
                    let contribution = read_frame(stream, tag)?;
                    if contribution.len() != sum.len() {
                        return Err(TrainError::Collective(format!(
                            "rank {} sent {} values, expected {}",
                            i + 1,
                            contribution.len(),
                            sum.len()
                        )));
                    }
                    for (acc, v) in sum.iter_mut().zip(contribution) {
                        *acc += v;
                    }
                }
                let n = self.world_size as f32;
                for v in &mut sum {
                    *v /= n;
                }
                for stream in peers.iter_mut() {
                    write_frame(stream, tag, &sum)?;
                }
                values.copy_from_slice(&sum);
                Ok(())
            }
        }
    }
}

impl Collective for TcpCollective {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_mean(&self, values: &mut [f32]) -> Result<(), TrainError> {
        self.exchange(TAG_REDUCE, values)
    }

    fn barrier(&self) -> Result<(), TrainError> {
        self.exchange(TAG_BARRIER, &mut [])
    }

    fn shutdown(&self) -> Result<(), TrainError> {
        self.barrier()?;
        *self.links.lock() = Links::Closed;
        Ok(())
    }
}

fn configure(stream: &TcpStream, read_timeout: Option<Duration>) -> Result<(), TrainError> {
    stream
        .set_nodelay(true)
        .map_err(|e| io_err("configuring stream", e))?;
    stream
        .set_read_timeout(read_timeout)
        .map_err(|e| io_err("configuring stream", e))
}

fn read_hello(stream: &mut TcpStream) -> Result<(u32, usize, usize), TrainError> {
    let mut buf = [0u8; 12];
    stream.read_exact(&mut buf).map_err(|e| io_err("reading hello", e))?;
    let word = |i: usize| u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
    Ok((word(0), word(4) as usize, word(8) as usize))
}

/// Frame: `tag: u8`, `len: u64 LE`, `len` f32 LE values.
fn write_frame(stream: &mut TcpStream, tag: u8, values: &[f32]) -> Result<(), TrainError> {
    let mut buf = Vec::with_capacity(9 + values.len() * 4);
    buf.push(tag);
    buf.extend_from_slice(&(values.len() as u64).to_le_bytes());
    for v in values {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    stream.write_all(&buf).map_err(|e| io_err("sending frame", e))
}

fn read_frame(stream: &mut TcpStream, expected_tag: u8) -> Result<Vec<f32>, TrainError> {
    let mut header = [0u8; 9];
    stream
        .read_exact(&mut header)
        .map_err(|e| io_err("reading frame header", e))?;
    if header[0] != expected_tag {
        return Err(TrainError::Collective(format!(
            "expected frame tag {expected_tag}, got {}; ranks are out of step",
            header[0]
        )));
    }
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&header[1..]);
    let len = u64::from_le_bytes(len_bytes) as usize;
    let mut payload = vec![0u8; len * 4];
    stream
        .read_exact(&mut payload)
        .map_err(|e| io_err("reading frame payload", e))?;
    Ok(payload
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const TIMEOUT: Duration = Duration::from_secs(10);

    /// Run `f` on every rank of a loopback group and collect the results by rank.
    fn run_group<T, F>(world: usize, f: F) -> Vec<T>
    where
        T: Send + 'static,
        F: Fn(TcpCollective) -> T + Send + Sync + Clone + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut handles = Vec::new();
        for rank in 1..world {
            let f = f.clone();
            handles.push(thread::spawn(move || {
                f(TcpCollective::spoke(rank, world, addr, TIMEOUT).unwrap())
            }));
        }
        let hub = TcpCollective::hub(listener, world, TIMEOUT).unwrap();
        let mut out = vec![f(hub)];
        for h in handles {
            out.push(h.join().unwrap());
        }
        out
    }

    #[test]
    fn single_process_is_identity() {
        let group = SingleProcess;
        let mut v = vec![1.0, 2.0];
        group.all_reduce_mean(&mut v).unwrap();
        assert_eq!(v, vec![1.0, 2.0]);
        assert_eq!(group.world_size(), 1);
        group.barrier().unwrap();
        group.shutdown().unwrap();
    }

    #[test]
    fn all_ranks_receive_identical_mean() {
        let results = run_group(3, |group| {
            let r = group.rank() as f32;
            let mut v = vec![r, 10.0 * r, 1.0];
            group.all_reduce_mean(&mut v).unwrap();
            group.barrier().unwrap();
            group.shutdown().unwrap();
            v
        });
        for v in &results {
            assert_eq!(v, &results[0]);
        }
        assert_eq!(results[0], vec![1.0, 10.0, 1.0]);
    }

    #[test]
    fn repeated_reductions_stay_in_step() {
        let results = run_group(2, |group| {
            let mut last = Vec::new();
            for step in 0..5 {
                let mut v = vec![(group.rank() + step) as f32; 4];
                group.all_reduce_mean(&mut v).unwrap();
                last = v;
            }
            group.shutdown().unwrap();
            last
        });
        assert_eq!(results[0], vec![4.5; 4]);
        assert_eq!(results[1], vec![4.5; 4]);
    }

    #[test]
    fn calls_after_shutdown_fail() {
        let results = run_group(2, |group| {
            group.shutdown().unwrap();
            group.barrier().is_err()
        });
        assert!(results.iter().all(|failed| *failed));
    }

    #[test]
    fn slow_master_does_not_trip_the_join_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let join = Duration::from_millis(500);
        let spoke = thread::spawn(move || {
            let group = TcpCollective::spoke(1, 2, addr, join).unwrap();
            let mut v = vec![3.0f32];
            let reduced = group.all_reduce_mean(&mut v).map(|_| v);
            group.shutdown().unwrap();
            reduced
        });

        let hub = TcpCollective::hub(listener, 2, join).unwrap();
        // Master-only work (evaluation, checkpoint) longer than the join timeout.
        thread::sleep(Duration::from_millis(1500));
        let mut v = vec![1.0f32];
        hub.all_reduce_mean(&mut v).unwrap();
        hub.shutdown().unwrap();

        assert_eq!(v, vec![2.0]);
        assert_eq!(spoke.join().unwrap().unwrap(), vec![2.0]);
    }

    #[test]
    fn hub_times_out_without_peers() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let err = TcpCollective::hub(listener, 2, Duration::from_millis(200))
            .err()
            .unwrap();
        assert!(matches!(err, TrainError::Collective(_)));
    }
}
