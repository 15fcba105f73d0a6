//! The per-interface transaction log: an append-only journal of the
//! kernels sitting in upstream buffers, replayed after a crash so nothing
//! in flight is silently lost.
//!
//! The on-disk stream reuses the wire framing. Each packet is one record:
//! tag 1 (insert) followed by the kernel's source, destination and frame;
//! tag 2 (erase) followed by the kernel id. Replay folds the records and
//! returns the survivors.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use hashbrown::HashMap;

use quark::logging::{self, Logger};
use quark::shared::NetworkResult;

use crate::codec::buffer::Buffer;
use crate::codec::packet::{take_packet, PacketReader, PacketWriter};
use crate::codec::wire;
use crate::ifaddr::IfaceAddr;
use crate::kernel::{Kernel, KernelBox, KernelId};
use crate::types::TypeRegistry;

const TAG_INSERT: u8 = 1;
const TAG_ERASE: u8 = 2;

/// The engine's view of the journal: record a kernel entering the upstream
/// buffer, or leaving it.
pub trait Journal {
    fn insert(&mut self, kernel: &dyn Kernel);
    fn erase(&mut self, id: KernelId);
}

/// The file name a given interface journals to.
pub fn log_path(directory: &Path, ifaddr: &IfaceAddr) -> PathBuf {
    directory.join(format!(
        "transactions-{}-{}",
        ifaddr.address(),
        ifaddr.prefix()
    ))
}

pub struct TransactionLog {
    file: File,
    log: Logger,
}

impl TransactionLog {
    /// Open (or create) the journal for appending.
    pub fn open<'a, L: Into<Option<&'a Logger>>>(
        path: &Path,
        log: L,
    ) -> std::io::Result<TransactionLog> {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::discard(),
        };
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(TransactionLog { file, log })
    }

    fn append(&mut self, buf: &mut Buffer) {
        let result = self
            .file
            .write_all(buf.read_slice())
            .and_then(|_| self.file.flush());
        if let Err(err) = result {
            logging::warn!(self.log, "transaction log write error"; "error" => %err);
        }
        buf.clear();
    }
}

impl Journal for TransactionLog {
    fn insert(&mut self, kernel: &dyn Kernel) {
        let mut buf = Buffer::new();
        let write = |writer: &mut PacketWriter| -> NetworkResult<()> {
            writer.write_u8(TAG_INSERT)?;
            wire::write_endpoint(writer, kernel.header().source())?;
            wire::write_endpoint(writer, kernel.header().destination())?;
            wire::write_kernel(writer, kernel)?;
            Ok(())
        };
        let mut writer = PacketWriter::begin(&mut buf);
        match write(&mut writer).and_then(|_| writer.end()) {
            Ok(()) => self.append(&mut buf),
            Err(err) => {
                logging::warn!(self.log, "transaction log encode error";
                               "error" => ?err,
                               "kernel" => %kernel.header());
            }
        }
    }

    fn erase(&mut self, id: KernelId) {
        let mut buf = Buffer::new();
        let write = |writer: &mut PacketWriter| -> NetworkResult<()> {
            writer.write_u8(TAG_ERASE)?;
            writer.write_u64::<BigEndian>(id)?;
            Ok(())
        };
        let mut writer = PacketWriter::begin(&mut buf);
        match write(&mut writer).and_then(|_| writer.end()) {
            Ok(()) => self.append(&mut buf),
            Err(err) => {
                logging::warn!(self.log, "transaction log encode error";
                               "error" => ?err, "id" => id);
            }
        }
    }
}

/// Fold the journal at `path` and reconstruct the kernels whose inserts
/// were never erased. The file is truncated afterwards; the caller owns
/// re-journaling whatever recovery re-sends.
pub fn replay<'a, L: Into<Option<&'a Logger>>>(
    path: &Path,
    types: &TypeRegistry,
    log: L,
) -> Vec<KernelBox> {
    let log = match log.into() {
        Some(log) => log.new(logging::o!()),
        _ => logging::discard(),
    };
    let mut buf = Buffer::new();
    match File::open(path) {
        Ok(mut file) => {
            let mut bytes = Vec::new();
            if let Err(err) = file.read_to_end(&mut bytes) {
                logging::warn!(log, "transaction log read error"; "error" => %err);
                return Vec::new();
            }
            buf.extend(&bytes);
        }
        Err(_) => return Vec::new(),
    }

    let mut survivors: HashMap<KernelId, KernelBox> = HashMap::new();
    loop {
        let payload = match take_packet(&mut buf) {
            Ok(Some(payload)) => payload,
            Ok(None) => break,
            Err(err) => {
                logging::warn!(log, "corrupt transaction log"; "error" => ?err);
                break;
            }
        };
        if let Err(err) = replay_record(&payload, types, &mut survivors) {
            logging::warn!(log, "bad transaction record"; "error" => ?err);
        }
    }
    if !buf.is_empty() {
        logging::warn!(log, "trailing bytes in transaction log"; "count" => buf.len());
    }

    // the survivors re-enter recovery; start the journal over
    if let Err(err) = File::create(path) {
        logging::warn!(log, "transaction log truncate error"; "error" => %err);
    }

    let mut kernels: Vec<KernelBox> = survivors.into_values().collect();
    kernels.sort_by_key(|k| k.header().id());
    kernels
}

fn replay_record(
    payload: &[u8],
    types: &TypeRegistry,
    survivors: &mut HashMap<KernelId, KernelBox>,
) -> NetworkResult<()> {
    let mut reader = PacketReader::new(payload);
    match reader.read_u8()? {
        TAG_INSERT => {
            let source = wire::read_endpoint(&mut reader)?;
            let destination = wire::read_endpoint(&mut reader)?;
            let mut kernel = wire::read_kernel(&mut reader, types)?;
            kernel.header_mut().set_source(source);
            kernel.header_mut().set_destination(destination);
            survivors.insert(kernel.header().id(), kernel);
        }
        TAG_ERASE => {
            let id = reader.read_u64::<BigEndian>()?;
            survivors.remove(&id);
        }
        _ => {
            return Err(quark::shared::NetworkError::Fatal(
                quark::shared::ErrorType::BadEncoding,
            ))
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::Endpoint;
    use crate::kernel::{Header, Link};
    use crate::kernel_cast;
    use std::io::Write as _;

    struct Job(Header);

    impl Job {
        fn boxed() -> KernelBox {
            Box::new(Job(Header::new()))
        }
    }

    impl Kernel for Job {
        fn header(&self) -> &Header {
            &self.0
        }

        fn header_mut(&mut self) -> &mut Header {
            &mut self.0
        }

        fn wire_type(&self) -> u16 {
            21
        }

        kernel_cast!();
    }

    fn types() -> TypeRegistry {
        let mut types = TypeRegistry::new();
        types.register(21, Job::boxed);
        types
    }

    fn job(id: u64) -> Job {
        let mut header = Header::new();
        header.set_id(id);
        header.set_parent(Link::Id(1));
        header.set_destination(Some(Endpoint::v4(10, 0, 0, 2, 5000)));
        Job(header)
    }

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("txlog-{}-{}", std::process::id(), name))
    }

    #[test]
    fn test_replay_returns_unmatched_inserts() {
        let path = temp_path("unmatched");
        {
            let mut txlog = TransactionLog::open(&path, None).unwrap();
            txlog.insert(&job(10));
            txlog.insert(&job(11));
            txlog.insert(&job(12));
            txlog.erase(11);
        }
        let kernels = replay(&path, &types(), None);
        let ids: Vec<u64> = kernels.iter().map(|k| k.header().id()).collect();
        assert_eq!(ids, vec![10, 12]);
        assert_eq!(
            kernels[0].header().destination(),
            Some(&Endpoint::v4(10, 0, 0, 2, 5000))
        );
        // replay starts the journal over
        let again = replay(&path, &types(), None);
        assert!(again.is_empty());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_replay_of_missing_file_is_empty() {
        let path = temp_path("missing");
        assert!(replay(&path, &types(), None).is_empty());
    }

    #[test]
    fn test_replay_survives_trailing_garbage() {
        let path = temp_path("garbage");
        {
            let mut txlog = TransactionLog::open(&path, None).unwrap();
            txlog.insert(&job(10));
        }
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            // a torn record: length prefix promising more than is there
            file.write_all(&[0, 0, 0, 99, 1, 2, 3]).unwrap();
        }
        let kernels = replay(&path, &types(), None);
        assert_eq!(kernels.len(), 1);
        assert_eq!(kernels[0].header().id(), 10);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_log_path_is_per_interface() {
        let dir = PathBuf::from("/var/lib/gravitond");
        let a = log_path(&dir, &"10.0.0.1/16".parse().unwrap());
        let b = log_path(&dir, &"10.0.0.2/16".parse().unwrap());
        assert_ne!(a, b);
    }
}
