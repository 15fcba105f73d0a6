use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::PathBuf;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use quark::shared::{ErrorType, NetworkError, NetworkResult};

use crate::addr::Endpoint;
use crate::app::Application;
use crate::codec::packet::{PacketReader, PacketWriter};
use crate::ifaddr::IfaceAddr;
use crate::kernel::{ExitCode, Flags, Kernel, KernelBox, Link};
use crate::types::TypeRegistry;

// Address family tags on the wire.
const FAMILY_NONE: u8 = 0;
const FAMILY_UNIX: u8 = 1;
const FAMILY_INET: u8 = 2;
const FAMILY_INET6: u8 = 10;

/// endpoint := u8 family || family-specific address. `None` is carried as
/// family 0 so negotiated header slots keep a fixed layout.
pub fn write_endpoint(out: &mut PacketWriter, endpoint: Option<&Endpoint>) -> NetworkResult<()> {
    match endpoint {
        None => out.write_u8(FAMILY_NONE)?,
        Some(Endpoint::Ip(SocketAddr::V4(addr))) => {
            out.write_u8(FAMILY_INET)?;
            out.write_u32::<BigEndian>(u32::from(*addr.ip()))?;
            out.write_u16::<BigEndian>(addr.port())?;
        }
        Some(Endpoint::Ip(SocketAddr::V6(addr))) => {
            out.write_u8(FAMILY_INET6)?;
            out.write_all(&addr.ip().octets())?;
            out.write_u16::<BigEndian>(addr.port())?;
        }
        Some(Endpoint::Unix(path)) => {
            let bytes = path.as_os_str().as_bytes();
            if bytes.len() > u8::MAX as usize {
                return Err(NetworkError::Fatal(ErrorType::PayloadTooLarge));
            }
            out.write_u8(FAMILY_UNIX)?;
            out.write_u8(bytes.len() as u8)?;
            out.write_all(bytes)?;
        }
    }
    Ok(())
}

pub fn read_endpoint(input: &mut PacketReader) -> NetworkResult<Option<Endpoint>> {
    match input.read_u8()? {
        FAMILY_NONE => Ok(None),
        FAMILY_INET => {
            let ip = Ipv4Addr::from(input.read_u32::<BigEndian>()?);
            let port = input.read_u16::<BigEndian>()?;
            Ok(Some(Endpoint::Ip(SocketAddr::new(IpAddr::V4(ip), port))))
        }
        FAMILY_INET6 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(input.take(16)?);
            let port = input.read_u16::<BigEndian>()?;
            Ok(Some(Endpoint::Ip(SocketAddr::new(
                IpAddr::V6(Ipv6Addr::from(octets)),
                port,
            ))))
        }
        FAMILY_UNIX => {
            let len = input.read_u8()? as usize;
            let bytes = input.take(len)?.to_vec();
            Ok(Some(Endpoint::Unix(PathBuf::from(
                std::ffi::OsString::from_vec(bytes),
            ))))
        }
        family => Err(NetworkError::Fatal(ErrorType::UnknownFamily(family))),
    }
}

/// application_record := u64_be app_id || u16_be exec_path_len || utf8 path
pub fn write_application(out: &mut PacketWriter, app: &Application) -> NetworkResult<()> {
    let bytes = app.exec_path.as_os_str().as_bytes();
    if bytes.len() > u16::MAX as usize {
        return Err(NetworkError::Fatal(ErrorType::PayloadTooLarge));
    }
    out.write_u64::<BigEndian>(app.id)?;
    out.write_u16::<BigEndian>(bytes.len() as u16)?;
    out.write_all(bytes)?;
    Ok(())
}

pub fn read_application(input: &mut PacketReader) -> NetworkResult<Application> {
    let id = input.read_u64::<BigEndian>()?;
    let len = input.read_u16::<BigEndian>()? as usize;
    let bytes = input.take(len)?.to_vec();
    Ok(Application::new(
        id,
        PathBuf::from(std::ffi::OsString::from_vec(bytes)),
    ))
}

pub fn write_ifaddr(out: &mut PacketWriter, ifaddr: &IfaceAddr) -> NetworkResult<()> {
    out.write_u32::<BigEndian>(u32::from(ifaddr.address()))?;
    out.write_u8(ifaddr.prefix())?;
    Ok(())
}

pub fn read_ifaddr(input: &mut PacketReader) -> NetworkResult<IfaceAddr> {
    let addr = Ipv4Addr::from(input.read_u32::<BigEndian>()?);
    let prefix = input.read_u8()?;
    if prefix > 32 {
        return Err(NetworkError::Fatal(ErrorType::BadEncoding));
    }
    Ok(IfaceAddr::new(addr, prefix))
}

/// kernel_frame := u16 type_id || u16 result || u64 id || u8 flags ||
/// u64 parent_id || u64 principal_id || type-specific payload. A kernel
/// with `CARRIES_PARENT` serializes its parent frame immediately after its
/// own.
pub fn write_kernel(out: &mut PacketWriter, kernel: &dyn Kernel) -> NetworkResult<()> {
    let type_id = kernel.wire_type();
    if type_id == 0 {
        return Err(NetworkError::Fatal(ErrorType::NotMobile));
    }
    let header = kernel.header();
    out.write_u16::<BigEndian>(type_id)?;
    out.write_u16::<BigEndian>(header.result() as u16)?;
    out.write_u64::<BigEndian>(header.id())?;
    out.write_u8(header.flags().bits())?;
    out.write_u64::<BigEndian>(header.parent().id())?;
    out.write_u64::<BigEndian>(header.principal().id())?;
    kernel.write_payload(out)?;
    if header.carries_parent() {
        match header.parent() {
            Link::Kernel(parent) => write_kernel(out, &**parent)?,
            _ => return Err(NetworkError::Fatal(ErrorType::MissingParent)),
        }
    }
    Ok(())
}

pub fn read_kernel(input: &mut PacketReader, types: &TypeRegistry) -> NetworkResult<KernelBox> {
    let type_id = input.read_u16::<BigEndian>()?;
    let mut kernel = types
        .construct(type_id)
        .ok_or(NetworkError::Fatal(ErrorType::UnknownType(type_id)))?;
    let result = ExitCode::from_u16(input.read_u16::<BigEndian>()?)
        .ok_or(NetworkError::Fatal(ErrorType::BadEncoding))?;
    let id = input.read_u64::<BigEndian>()?;
    let flags = Flags::from_bits(input.read_u8()?);
    let parent_id = input.read_u64::<BigEndian>()?;
    let principal_id = input.read_u64::<BigEndian>()?;
    {
        let header = kernel.header_mut();
        header.set_result(result);
        header.set_id(id);
        *header.flags_mut() = flags;
        header.set_parent(if parent_id == 0 {
            Link::None
        } else {
            Link::Id(parent_id)
        });
        header.set_principal(if principal_id == 0 {
            Link::None
        } else {
            Link::Id(principal_id)
        });
    }
    kernel.read_payload(input)?;
    if flags.contains(Flags::CARRIES_PARENT) {
        let parent = read_kernel(input, types)?;
        kernel.header_mut().set_parent(Link::Kernel(parent));
    }
    Ok(kernel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::buffer::Buffer;
    use crate::codec::packet::take_packet;
    use crate::kernel::Header;
    use crate::kernel_cast;

    struct Sample {
        header: Header,
        value: u64,
    }

    impl Sample {
        fn boxed() -> KernelBox {
            Box::new(Sample {
                header: Header::new(),
                value: 0,
            })
        }
    }

    impl Kernel for Sample {
        fn header(&self) -> &Header {
            &self.header
        }

        fn header_mut(&mut self) -> &mut Header {
            &mut self.header
        }

        fn wire_type(&self) -> u16 {
            40
        }

        fn write_payload(&self, out: &mut PacketWriter) -> NetworkResult<()> {
            out.write_u64::<BigEndian>(self.value)?;
            Ok(())
        }

        fn read_payload(&mut self, input: &mut PacketReader) -> NetworkResult<()> {
            self.value = input.read_u64::<BigEndian>()?;
            Ok(())
        }

        kernel_cast!();
    }

    fn types() -> TypeRegistry {
        let mut types = TypeRegistry::new();
        types.register(40, Sample::boxed);
        types
    }

    fn roundtrip<F: FnOnce(&mut PacketWriter) -> NetworkResult<()>>(write: F) -> Vec<u8> {
        let mut buf = Buffer::new();
        let mut writer = PacketWriter::begin(&mut buf);
        write(&mut writer).unwrap();
        writer.end().unwrap();
        take_packet(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn test_endpoint_roundtrip() {
        let cases = vec![
            None,
            Some(Endpoint::v4(10, 0, 0, 1, 33333)),
            Some(Endpoint::Ip("[2001:db8::1]:8080".parse().unwrap())),
            Some(Endpoint::Unix(PathBuf::from("/run/gravitond.sock"))),
        ];
        for case in cases {
            let payload = roundtrip(|w| write_endpoint(w, case.as_ref()));
            let mut reader = PacketReader::new(&payload);
            assert_eq!(read_endpoint(&mut reader).unwrap(), case);
            assert_eq!(reader.remaining(), 0);
        }
    }

    #[test]
    fn test_endpoint_unknown_family() {
        let payload = [77u8];
        let mut reader = PacketReader::new(&payload);
        assert_eq!(
            read_endpoint(&mut reader),
            Err(NetworkError::Fatal(ErrorType::UnknownFamily(77)))
        );
    }

    #[test]
    fn test_application_roundtrip() {
        let app = Application::new(3, "/usr/bin/spectra");
        let payload = roundtrip(|w| write_application(w, &app));
        let mut reader = PacketReader::new(&payload);
        let back = read_application(&mut reader).unwrap();
        assert_eq!(back.id, 3);
        assert_eq!(back.exec_path, app.exec_path);
    }

    #[test]
    fn test_ifaddr_roundtrip() {
        let ifaddr: IfaceAddr = "10.0.0.2/16".parse().unwrap();
        let payload = roundtrip(|w| write_ifaddr(w, &ifaddr));
        let mut reader = PacketReader::new(&payload);
        assert_eq!(read_ifaddr(&mut reader).unwrap(), ifaddr);
    }

    #[test]
    fn test_kernel_frame_roundtrip() {
        let mut kernel = Sample {
            header: Header::new(),
            value: 0xfeed_f00d,
        };
        kernel.header.set_id(1234);
        kernel.header.set_result(ExitCode::Success);
        kernel.header.set_parent(Link::Id(77));
        kernel.header.set_principal(Link::Id(77));
        kernel.header.flags_mut().set(Flags::PRIORITY);

        let payload = roundtrip(|w| write_kernel(w, &kernel));
        let mut reader = PacketReader::new(&payload);
        let back = read_kernel(&mut reader, &types()).unwrap();

        assert_eq!(back.wire_type(), 40);
        assert_eq!(back.header().id(), 1234);
        assert_eq!(back.header().result(), ExitCode::Success);
        assert_eq!(back.header().parent().id(), 77);
        assert_eq!(back.header().principal().id(), 77);
        assert!(back.header().flags().contains(Flags::PRIORITY));
        let back = crate::kernel::downcast::<Sample>(back).ok().unwrap();
        assert_eq!(back.value, 0xfeed_f00d);
    }

    #[test]
    fn test_kernel_frame_carries_parent() {
        let mut parent = Sample {
            header: Header::new(),
            value: 1,
        };
        parent.header.set_id(50);
        let mut child = Sample {
            header: Header::new(),
            value: 2,
        };
        child.header.set_id(51);
        child.header.flags_mut().set(Flags::CARRIES_PARENT);
        child.header.set_parent(Link::Kernel(Box::new(parent)));

        let payload = roundtrip(|w| write_kernel(w, &child));
        let mut reader = PacketReader::new(&payload);
        let back = read_kernel(&mut reader, &types()).unwrap();

        assert_eq!(back.header().id(), 51);
        match back.header().parent() {
            Link::Kernel(parent) => {
                assert_eq!(parent.header().id(), 50);
                assert_eq!(parent.wire_type(), 40);
            }
            link => panic!("Expected a carried parent, got {:?}", link),
        }
    }

    #[test]
    fn test_unknown_type_is_fatal() {
        let mut kernel = Sample {
            header: Header::new(),
            value: 3,
        };
        kernel.header.set_id(9);
        let payload = roundtrip(|w| write_kernel(w, &kernel));
        let mut reader = PacketReader::new(&payload);
        let empty = TypeRegistry::new();
        assert_eq!(
            read_kernel(&mut reader, &empty).err(),
            Some(NetworkError::Fatal(ErrorType::UnknownType(40)))
        );
    }

    #[test]
    fn test_non_mobile_kernel_is_rejected() {
        struct Resident(Header);
        impl Kernel for Resident {
            fn header(&self) -> &Header {
                &self.0
            }
            fn header_mut(&mut self) -> &mut Header {
                &mut self.0
            }
            kernel_cast!();
        }

        let mut buf = Buffer::new();
        let mut writer = PacketWriter::begin(&mut buf);
        assert_eq!(
            write_kernel(&mut writer, &Resident(Header::new())),
            Err(NetworkError::Fatal(ErrorType::NotMobile))
        );
    }
}
