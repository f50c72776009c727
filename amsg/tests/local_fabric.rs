//! Multi-core communicator tests over the in-process fabric.

mod common;

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use amsg::site::OPEN_MPI;
use amsg::{CommConfig, Error, Fixed, Geometry, SiteAdapter};
use common::{progress_until, run_init, run_job};

#[test]
fn n_sends_run_n_handlers() {
    const N: u64 = 200;
    let results = run_job(4, 2, CommConfig::default(), |mut comm| {
        let count = Rc::new(Cell::new(0u64));
        let sum = Rc::new(Cell::new(0u64));
        let (c, s) = (Rc::clone(&count), Rc::clone(&sum));
        let id = comm
            .register_message::<u64, _>(move |_, _, v| {
                c.set(c.get() + 1);
                s.set(s.get() + v);
                Ok(())
            })
            .unwrap();
        comm.activate().unwrap();

        let next = (comm.mycore() + 1) % comm.cores();
        for i in 0..N {
            comm.send(next, id, &i).unwrap();
        }
        progress_until(&mut comm, || count.get() == N);
        comm.barrier().unwrap();
        let stats = comm.stats();
        comm.finish().unwrap();
        (count.get(), sum.get(), stats)
    });
    for (count, sum, stats) in results {
        assert_eq!(count, N);
        assert_eq!(sum, N * (N - 1) / 2);
        assert_eq!(stats.messages_sent, N);
        assert_eq!(stats.messages_received, N);
    }
}

#[test]
fn small_ring_applies_backpressure_without_loss() {
    const N: u32 = 500;
    let config = CommConfig::new().with_log2_send_contexts(1).with_log2_recv_contexts(1);
    let results = run_job(2, 2, config, |mut comm| {
        let got = Rc::new(RefCell::new(Vec::new()));
        let g = Rc::clone(&got);
        let id = comm
            .register_message::<u32, _>(move |_, src, v| {
                g.borrow_mut().push((src, v));
                Ok(())
            })
            .unwrap();
        comm.activate().unwrap();

        if comm.mycore() == 0 {
            for i in 0..N {
                comm.send(1, id, &i).unwrap();
            }
        } else {
            progress_until(&mut comm, || got.borrow().len() == N as usize);
        }
        comm.barrier().unwrap();
        let stats = comm.stats();
        comm.finish().unwrap();
        let got = got.borrow().clone();
        (stats, got)
    });

    let (sender, _) = &results[0];
    assert!(sender.send_stalls > 0);
    let (_, received) = &results[1];
    let expected: Vec<(usize, u32)> = (0..N).map(|i| (0, i)).collect();
    assert_eq!(received, &expected);
}

#[test]
fn receive_ring_never_runs_dry() {
    let config = CommConfig::new().with_log2_recv_contexts(2);
    run_job(2, 1, config, |mut comm| {
        let count = Rc::new(Cell::new(0usize));
        let c = Rc::clone(&count);
        let id = comm
            .register_message::<(), _>(move |_, _, ()| {
                c.set(c.get() + 1);
                Ok(())
            })
            .unwrap();
        comm.activate().unwrap();
        assert_eq!(comm.armed_receives(), 4);

        let peer = 1 - comm.mycore();
        for _ in 0..50 {
            comm.send(peer, id, &()).unwrap();
            comm.try_progress().unwrap();
            assert_eq!(comm.armed_receives(), 4);
        }
        progress_until(&mut comm, || count.get() == 50);
        assert_eq!(comm.armed_receives(), 4);
        comm.barrier().unwrap();
        comm.finish().unwrap();
        assert_eq!(comm.armed_receives(), 0);
    });
}

#[test]
fn every_core_agrees_on_geometry() {
    let results = run_job(6, 3, CommConfig::default(), |comm| {
        (comm.mycore(), comm.locale(), comm.locale_core(), comm.geometry(), comm.site())
    });
    let expected = Geometry::new(6, 3).unwrap();
    for (core, locale, locale_core, geometry, site) in results {
        assert_eq!(geometry, expected);
        assert_eq!(locale, core / 3);
        assert_eq!(locale_core, core % 3);
        assert_eq!(site, "fixed");
    }
}

#[test]
fn locale_size_mismatch_fails_everywhere() {
    let results = run_init(
        4,
        CommConfig::default(),
        |core| {
            let size = if core == 0 { 2 } else { 4 };
            vec![Box::new(Fixed::new(size)) as Box<dyn SiteAdapter>]
        },
        |_| Vec::new(),
        |_, comm| comm.err(),
    );
    for err in results {
        assert!(matches!(err, Some(Error::LocaleSizeMismatch { min: 2, max: 4 })));
    }
}

fn open_mpi_env(local_rank: usize, local_size: usize) -> Vec<(String, String)> {
    vec![
        ("OMPI_COMM_WORLD_LOCAL_RANK".into(), local_rank.to_string()),
        ("OMPI_COMM_WORLD_LOCAL_SIZE".into(), local_size.to_string()),
    ]
}

#[test]
fn round_robin_layout_is_rejected() {
    // Cores 0 and 2 on one node, 1 and 3 on the other.
    let results = run_init(
        4,
        CommConfig::default(),
        |_| vec![Box::new(OPEN_MPI) as Box<dyn SiteAdapter>],
        |core| open_mpi_env(core / 2, 2),
        |_, comm| comm.err(),
    );
    for err in results {
        assert!(matches!(
            err,
            Some(Error::NonContiguousLayout {
                core: 1,
                reported: 0,
                expected: 1
            })
        ));
    }
}

#[test]
fn missing_launcher_on_one_core_fails_everywhere() {
    let results = run_init(
        2,
        CommConfig::default(),
        |_| amsg::default_adapters(),
        |core| if core == 0 { open_mpi_env(0, 2) } else { Vec::new() },
        |core, comm| (core, comm.err()),
    );
    for (core, err) in results {
        match core {
            0 => assert!(matches!(err, Some(Error::LocaleSizeMismatch { min: 0, max: 2 }))),
            _ => assert!(matches!(err, Some(Error::NoSiteAdapter))),
        }
    }
}

#[test]
fn launcher_env_drives_geometry() {
    let results = run_init(
        4,
        CommConfig::default(),
        |_| amsg::default_adapters(),
        |core| open_mpi_env(core % 2, 2),
        |_, comm| {
            let comm = comm.unwrap();
            (comm.site(), comm.locales())
        },
    );
    for (site, locales) in results {
        assert_eq!(site, "openmpi");
        assert_eq!(locales, 2);
    }
}

#[test]
fn broadcast_callback_fires_once() {
    let results = run_job(3, 3, CommConfig::default(), |mut comm| {
        let got = Rc::new(Cell::new(0u32));
        let g = Rc::clone(&got);
        let id = comm
            .register_message::<String, _>(move |_, src, msg| {
                assert_eq!(src, 0);
                assert_eq!(msg, "hello");
                g.set(g.get() + 1);
                Ok(())
            })
            .unwrap();
        comm.activate().unwrap();

        let fired = Rc::new(Cell::new(0u32));
        if comm.mycore() == 0 {
            let f = Rc::clone(&fired);
            comm.send_to_all_with_callback(id, &"hello".to_string(), move || f.set(f.get() + 1))
                .unwrap();
        }
        progress_until(&mut comm, || got.get() == 1);
        if comm.mycore() == 0 {
            progress_until(&mut comm, || fired.get() == 1);
            assert_eq!(comm.stats().messages_sent, 3);
        }
        comm.barrier().unwrap();
        comm.garbage_collect().unwrap();
        comm.finish().unwrap();
        (got.get(), fired.get())
    });
    assert_eq!(results[0], (1, 1));
    assert_eq!(results[1], (1, 0));
    assert_eq!(results[2], (1, 0));
}

#[test]
fn handlers_reply_through_outbox() {
    const ROUNDS: u64 = 32;
    let results = run_job(2, 1, CommConfig::default(), |mut comm| {
        let pongs = Rc::new(RefCell::new(HashMap::new()));
        let p = Rc::clone(&pongs);
        let pong = comm
            .register_message::<(u64, u64), _>(move |_, src, (i, doubled)| {
                p.borrow_mut().insert(i, (src, doubled));
                Ok(())
            })
            .unwrap();
        let ping = comm
            .register_message::<u64, _>(move |out, src, i| out.send(src, pong, &(i, i * 2)))
            .unwrap();
        comm.activate().unwrap();

        let peer = 1 - comm.mycore();
        for i in 0..ROUNDS {
            comm.send(peer, ping, &i).unwrap();
        }
        progress_until(&mut comm, || pongs.borrow().len() == ROUNDS as usize);
        comm.barrier().unwrap();
        comm.finish().unwrap();
        pongs.borrow().iter().all(|(i, (src, d))| *src == peer && *d == i * 2)
    });
    assert_eq!(results, vec![true, true]);
}

#[test]
fn callback_runs_after_delivery() {
    run_job(2, 2, CommConfig::default(), |mut comm| {
        let id = comm.register_message::<u8, _>(|_, _, _| Ok(())).unwrap();
        comm.activate().unwrap();
        let done = Rc::new(Cell::new(false));
        if comm.mycore() == 0 {
            let d = Rc::clone(&done);
            comm.send_with_callback(1, id, &7, move || d.set(true)).unwrap();
            progress_until(&mut comm, || done.get());
        } else {
            comm.poll(1).ok();
        }
        comm.barrier().unwrap();
        comm.finish().unwrap();
    });
}
