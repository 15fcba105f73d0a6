//! End-to-end exercises over real loopback sockets: two or more factories
//! in one process, each bound to its own 127.0.0.x address on a shared
//! port, exchanging kernels through the full codec / engine / pipeline
//! stack.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use graviton::addr::Endpoint;
use graviton::api::Context;
use graviton::factory::{Factory, Properties};
use graviton::kernel::{ExitCode, Header, Kernel, KernelBox, Link};
use graviton::kernel_cast;
use graviton::types::TypeRegistry;

fn node(port: u16, host: u8, types: TypeRegistry) -> Factory {
    let dir = std::env::temp_dir().join(format!(
        "graviton-test-{}-{}-{}",
        std::process::id(),
        port,
        host
    ));
    std::fs::create_dir_all(&dir).unwrap();
    let factory = Factory::new(
        Properties {
            num_threads: 2,
            port,
            connection_timeout: Duration::from_secs(2),
            max_connection_attempts: 5,
            transactions_directory: dir,
            allow_root: true,
            unix_socket: None,
            this_app: 0,
        },
        types,
        None,
    );
    factory.start();
    factory
        .remote()
        .add_server(format!("127.0.0.{}/8", host).parse().unwrap());
    factory
}

/// Give freshly started pipelines a moment to bind their listeners.
fn settle() {
    std::thread::sleep(Duration::from_millis(300));
}

fn wait_for_exit(factory: Arc<Factory>) -> i32 {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        tx.send(factory.wait()).ok();
    });
    rx.recv_timeout(Duration::from_secs(20))
        .expect("The cluster did not settle in time")
}

mod roundtrip {
    use super::*;

    const JOB_TYPE: u16 = 30;

    fn seen() -> &'static Mutex<Vec<(u64, ExitCode, u64)>> {
        static SEEN: OnceLock<Mutex<Vec<(u64, ExitCode, u64)>>> = OnceLock::new();
        SEEN.get_or_init(|| Mutex::new(Vec::new()))
    }

    struct Job {
        header: Header,
    }

    impl Job {
        fn boxed() -> KernelBox {
            Box::new(Job {
                header: Header::new(),
            })
        }
    }

    impl Kernel for Job {
        fn header(&self) -> &Header {
            &self.header
        }

        fn header_mut(&mut self) -> &mut Header {
            &mut self.header
        }

        fn wire_type(&self) -> u16 {
            JOB_TYPE
        }

        fn act(&mut self, _ctx: &mut Context) {
            self.header.return_to_parent(ExitCode::Success);
        }

        kernel_cast!();
    }

    struct Origin {
        header: Header,
        target: Endpoint,
    }

    impl Kernel for Origin {
        fn header(&self) -> &Header {
            &self.header
        }

        fn header_mut(&mut self) -> &mut Header {
            &mut self.header
        }

        fn act(&mut self, ctx: &mut Context) {
            let mut job = Job::boxed();
            job.header_mut().set_destination(Some(self.target.clone()));
            ctx.upstream_remote(self, job);
        }

        fn react(&mut self, child: KernelBox, _ctx: &mut Context) {
            seen().lock().unwrap().push((
                child.header().id(),
                child.header().result(),
                child.header().principal().id(),
            ));
            self.header.return_to_parent(ExitCode::Success);
        }

        kernel_cast!();
    }

    #[test]
    fn test_upstream_reply_round_trip_across_nodes() {
        let mut types_a = TypeRegistry::new();
        types_a.register(JOB_TYPE, Job::boxed);
        let mut types_b = TypeRegistry::new();
        types_b.register(JOB_TYPE, Job::boxed);

        let a = Arc::new(node(34710, 1, types_a));
        let b = Arc::new(node(34710, 2, types_b));
        settle();

        a.send(Box::new(Origin {
            header: Header::new(),
            target: Endpoint::v4(127, 0, 0, 2, 34710),
        }));

        assert_eq!(wait_for_exit(a), 0);

        let seen = seen().lock().unwrap();
        assert_eq!(seen.len(), 1);
        let (id, result, principal) = seen[0];
        assert_ne!(id, 0);
        assert_eq!(result, ExitCode::Success);
        assert_ne!(principal, 0);

        b.stop();
    }
}

mod no_principal {
    use super::*;

    const STRAY_TYPE: u16 = 31;

    fn results() -> &'static Mutex<Vec<ExitCode>> {
        static RESULTS: OnceLock<Mutex<Vec<ExitCode>>> = OnceLock::new();
        RESULTS.get_or_init(|| Mutex::new(Vec::new()))
    }

    struct Stray {
        header: Header,
    }

    impl Stray {
        fn boxed() -> KernelBox {
            Box::new(Stray {
                header: Header::new(),
            })
        }
    }

    impl Kernel for Stray {
        fn header(&self) -> &Header {
            &self.header
        }

        fn header_mut(&mut self) -> &mut Header {
            &mut self.header
        }

        fn wire_type(&self) -> u16 {
            STRAY_TYPE
        }

        kernel_cast!();
    }

    struct Origin {
        header: Header,
        target: Endpoint,
    }

    impl Kernel for Origin {
        fn header(&self) -> &Header {
            &self.header
        }

        fn header_mut(&mut self) -> &mut Header {
            &mut self.header
        }

        fn act(&mut self, ctx: &mut Context) {
            // aim a kernel at a principal the remote node does not know
            let mut stray = Stray::boxed();
            stray.header_mut().set_destination(Some(self.target.clone()));
            stray.header_mut().set_principal(Link::Id(0xdead_beef));
            ctx.upstream_remote(self, stray);
        }

        fn react(&mut self, child: KernelBox, _ctx: &mut Context) {
            results().lock().unwrap().push(child.header().result());
            self.header.return_to_parent(ExitCode::Success);
        }

        kernel_cast!();
    }

    #[test]
    fn test_unknown_principal_comes_back_as_no_principal_found() {
        let mut types_a = TypeRegistry::new();
        types_a.register(STRAY_TYPE, Stray::boxed);
        let mut types_b = TypeRegistry::new();
        types_b.register(STRAY_TYPE, Stray::boxed);

        let a = Arc::new(node(34720, 1, types_a));
        let b = Arc::new(node(34720, 2, types_b));
        settle();

        a.send(Box::new(Origin {
            header: Header::new(),
            target: Endpoint::v4(127, 0, 0, 2, 34720),
        }));

        assert_eq!(wait_for_exit(a), 0);
        assert_eq!(
            results().lock().unwrap().as_slice(),
            &[ExitCode::NoPrincipalFound]
        );

        b.stop();
    }
}

mod broadcast {
    use super::*;

    const FLOOD_TYPE: u16 = 32;

    static DELIVERIES: AtomicUsize = AtomicUsize::new(0);

    struct Flood {
        header: Header,
    }

    impl Flood {
        fn boxed() -> KernelBox {
            Box::new(Flood {
                header: Header::new(),
            })
        }
    }

    impl Kernel for Flood {
        fn header(&self) -> &Header {
            &self.header
        }

        fn header_mut(&mut self) -> &mut Header {
            &mut self.header
        }

        fn wire_type(&self) -> u16 {
            FLOOD_TYPE
        }

        fn act(&mut self, _ctx: &mut Context) {
            DELIVERIES.fetch_add(1, Ordering::SeqCst);
        }

        kernel_cast!();
    }

    #[test]
    fn test_broadcast_reaches_every_peer_once_and_local_once() {
        let port = 34730;
        let mut factories = Vec::new();
        for host in 1..=4u8 {
            let mut types = TypeRegistry::new();
            types.register(FLOOD_TYPE, Flood::boxed);
            factories.push(Arc::new(node(port, host, types)));
        }
        settle();
        // node 1 knows the three peers
        for host in 2..=4u8 {
            factories[0]
                .remote()
                .add_client(Endpoint::v4(127, 0, 0, host, port));
        }

        factories[0].send_remote(Flood::boxed());

        let deadline = Instant::now() + Duration::from_secs(15);
        while DELIVERIES.load(Ordering::SeqCst) < 4 {
            assert!(Instant::now() < deadline, "Broadcast did not settle");
            std::thread::sleep(Duration::from_millis(20));
        }
        // one delivery per peer plus one local, and not a single duplicate
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(DELIVERIES.load(Ordering::SeqCst), 4);

        for factory in &factories {
            factory.stop();
        }
    }
}
