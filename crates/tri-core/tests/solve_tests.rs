//! End-to-end solver scenarios on in-process meshes.

mod common;

use common::*;
use tri_core::prelude::*;

/// S1: 5x5 dense-as-sparse A = L * U with random triangular factors,
/// B = A * e. Expect X = e to machine precision on 1, 2 and 4 ranks.
#[test]
fn test_dense_5x5_all_ones() {
    let part = SupernodePartition::uniform(5, 2);
    let gf = random_factors(part, 11, 1.0);
    let n = gf.n();
    let ones = vec![1.0; n];
    let b = a_times(&gf, &ones, 1);
    for (pr, pc) in [(1, 1), (1, 2), (2, 1), (2, 2)] {
        let grid = ProcessGrid::new(pr, pc);
        let (x, _) = solve_on_mesh(&gf, &grid, &b, 1, &SolveOptions::default());
        for (i, &v) in x.iter().enumerate() {
            assert!(
                (v - 1.0).abs() < 1e-12,
                "x[{i}] = {v} on {pr}x{pc} grid, expected 1"
            );
        }
    }
}

/// S2: 10x10 block-tridiagonal with supernode size 2, nrhs = 3, verified
/// against ||A*X - B||_inf <= 1e-10 * ||A||_inf on a 2x2 grid.
#[test]
fn test_block_tridiagonal_2x2() {
    let part = SupernodePartition::uniform(10, 2);
    let gf = block_tridiagonal_factors(part, 22);
    let n = gf.n();
    let nrhs = 3;
    let xtrue: Vec<f64> = (0..n * nrhs).map(|i| (i % 7) as f64 - 3.0).collect();
    let b = a_times(&gf, &xtrue, nrhs);
    let grid = ProcessGrid::new(2, 2);
    let (x, _) = solve_on_mesh(&gf, &grid, &b, nrhs, &SolveOptions::default());
    check_solution(&gf, &x, &b, nrhs, 1e-10);
}

/// S3: identity matrix of order 16; X = B exactly on any grid.
#[test]
fn test_identity_is_exact() {
    let part = SupernodePartition::uniform(16, 4);
    let gf = identity_factors(part);
    let n = gf.n();
    let b: Vec<f64> = (0..n).map(|i| (i as f64) * 0.37 - 2.0).collect();
    for (pr, pc) in [(1, 1), (2, 2), (4, 1), (1, 4)] {
        let grid = ProcessGrid::new(pr, pc);
        let (x, _) = solve_on_mesh(&gf, &grid, &b, 1, &SolveOptions::default());
        assert_eq!(x, b, "identity solve must be exact on {pr}x{pc}");
    }
}

/// S4: all-singleton supernodes (s_K = 1) on a 2x2 grid exercise the
/// scalar diagonal path and depth-0 reduce trees.
#[test]
fn test_singleton_supernodes() {
    let part = SupernodePartition::uniform(9, 1);
    let gf = random_factors(part, 44, 0.6);
    let n = gf.n();
    let xtrue: Vec<f64> = (0..n).map(|i| 1.0 + (i as f64) * 0.1).collect();
    let b = a_times(&gf, &xtrue, 1);
    let grid = ProcessGrid::new(2, 2);
    let (x, _) = solve_on_mesh(&gf, &grid, &b, 1, &SolveOptions::default());
    check_solution(&gf, &x, &b, 1, 1e-11);
}

/// S5: one supernode depending on all earlier ones forces a wide fan-in;
/// contributions must merge in any arrival order without loss.
#[test]
fn test_unbalanced_fan_in() {
    let n = 12;
    let part = SupernodePartition::uniform(n, 2);
    let mut gf = block_tridiagonal_factors(part, 55);
    // Make the last block row of L and the last block column of U dense.
    for j in 0..n - 2 {
        for i in n - 2..n {
            gf.l[i + j * n] = 0.05 * (1.0 + (i + j) as f64 / n as f64);
            gf.u[j + i * n] = 0.05 * (1.0 + (i * j) as f64 / n as f64);
        }
    }
    let xtrue: Vec<f64> = (0..n).map(|i| ((i * 13) % 5) as f64 - 2.0).collect();
    let b = a_times(&gf, &xtrue, 1);
    for (pr, pc) in [(2, 2), (1, 4), (4, 1)] {
        let grid = ProcessGrid::new(pr, pc);
        let (x, _) = solve_on_mesh(&gf, &grid, &b, 1, &SolveOptions::default());
        check_solution(&gf, &x, &b, 1, 1e-10);
    }
}

/// A single-process grid performs zero communication.
#[test]
fn test_single_process_no_messages() {
    let part = SupernodePartition::uniform(8, 2);
    let gf = random_factors(part, 66, 0.8);
    let n = gf.n();
    let b: Vec<f64> = (0..n).map(|i| i as f64).collect();
    let grid = ProcessGrid::new(1, 1);
    let (x, stats) = solve_on_mesh(&gf, &grid, &b, 1, &SolveOptions::default());
    check_solution(&gf, &x, &b, 1, 1e-11);
    assert_eq!(stats[0].msgs_sent, 0);
    assert_eq!(stats[0].msgs_recv, 0);
}

/// Messages sent and received must balance across the mesh.
#[test]
fn test_message_counts_balance() {
    let part = SupernodePartition::uniform(12, 3);
    let gf = random_factors(part, 77, 0.7);
    let n = gf.n();
    let b: Vec<f64> = (0..n).map(|i| 1.0 / (1.0 + i as f64)).collect();
    let grid = ProcessGrid::new(2, 2);
    let (x, stats) = solve_on_mesh(&gf, &grid, &b, 1, &SolveOptions::default());
    check_solution(&gf, &x, &b, 1, 1e-10);
    let sent: u64 = stats.iter().map(|s| s.msgs_sent).sum();
    let recv: u64 = stats.iter().map(|s| s.msgs_recv).sum();
    assert_eq!(sent, recv);
    assert!(sent > 0, "a 2x2 solve of a coupled system must communicate");
}

/// A Pr = 1 mesh still runs the reduce machinery, just with trivial
/// per-row trees.
#[test]
fn test_row_only_distribution() {
    let part = SupernodePartition::uniform(10, 2);
    let gf = random_factors(part, 88, 0.9);
    let n = gf.n();
    let b: Vec<f64> = (0..n).map(|i| ((i % 4) as f64) - 1.5).collect();
    let grid = ProcessGrid::new(1, 4);
    let (x, _) = solve_on_mesh(&gf, &grid, &b, 1, &SolveOptions::default());
    check_solution(&gf, &x, &b, 1, 1e-10);
}

/// The GEMM-against-inverse path and the TRSM path agree.
#[test]
fn test_inverse_and_trsm_paths_agree() {
    let part = SupernodePartition::from_sizes(&[3, 1, 4, 2]);
    let gf = random_factors(part, 99, 0.8);
    let n = gf.n();
    let b: Vec<f64> = (0..n).map(|i| (i as f64).sin()).collect();
    let grid = ProcessGrid::new(2, 2);
    let inv_opts = SolveOptions {
        use_inverse_diagonals: true,
        ..Default::default()
    };
    let trsm_opts = SolveOptions {
        use_inverse_diagonals: false,
        ..Default::default()
    };
    let (x_inv, _) = solve_on_mesh(&gf, &grid, &b, 1, &inv_opts);
    let (x_trsm, _) = solve_on_mesh(&gf, &grid, &b, 1, &trsm_opts);
    for i in 0..n {
        assert!(
            (x_inv[i] - x_trsm[i]).abs() < 1e-11,
            "paths diverge at {i}: {} vs {}",
            x_inv[i],
            x_trsm[i]
        );
    }
}

/// Two-sided and one-sided transports produce the same numbers.
#[test]
fn test_transports_agree() {
    let part = SupernodePartition::uniform(12, 2);
    let gf = random_factors(part, 111, 0.7);
    let n = gf.n();
    let nrhs = 2;
    let b: Vec<f64> = (0..n * nrhs).map(|i| (i as f64).cos()).collect();
    let grid = ProcessGrid::new(2, 2);
    let two = SolveOptions {
        transport: TransportKind::TwoSided,
        ..Default::default()
    };
    let one = SolveOptions {
        transport: TransportKind::OneSided,
        ..Default::default()
    };
    let (x2, _) = solve_on_mesh(&gf, &grid, &b, nrhs, &two);
    let (x1, _) = solve_on_mesh(&gf, &grid, &b, nrhs, &one);
    for i in 0..n * nrhs {
        assert!(
            (x2[i] - x1[i]).abs() < 1e-11,
            "transports diverge at {i}: {} vs {}",
            x2[i],
            x1[i]
        );
    }
}

/// nrhs = 1 and nrhs > 1 share code paths: a duplicated column gives a
/// duplicated solution, matching the single-rhs result.
#[test]
fn test_multiple_rhs_match_single() {
    let part = SupernodePartition::uniform(8, 3);
    let gf = random_factors(part, 123, 0.9);
    let n = gf.n();
    let b1: Vec<f64> = (0..n).map(|i| (i as f64) * 0.2 - 1.0).collect();
    let mut b2 = vec![0.0; n * 2];
    b2[..n].copy_from_slice(&b1);
    b2[n..].copy_from_slice(&b1);
    let grid = ProcessGrid::new(2, 2);
    let (x1, _) = solve_on_mesh(&gf, &grid, &b1, 1, &SolveOptions::default());
    let (x2, _) = solve_on_mesh(&gf, &grid, &b2, 2, &SolveOptions::default());
    for i in 0..n {
        assert!((x2[i] - x1[i]).abs() < 1e-13);
        assert!((x2[n + i] - x1[i]).abs() < 1e-13);
    }
}

/// Intra-rank worker pool: same answer with several threads per rank.
#[cfg(feature = "parallel")]
#[test]
fn test_threaded_solve_matches() {
    let part = SupernodePartition::uniform(16, 2);
    let gf = random_factors(part, 321, 0.8);
    let n = gf.n();
    let nrhs = 2;
    let b: Vec<f64> = (0..n * nrhs).map(|i| ((i * 7) % 11) as f64 - 5.0).collect();
    let grid = ProcessGrid::new(2, 2);
    let serial = SolveOptions::default();
    let threaded = SolveOptions {
        threads: 3,
        ..Default::default()
    };
    let (xs, _) = solve_on_mesh(&gf, &grid, &b, nrhs, &serial);
    let (xt, _) = solve_on_mesh(&gf, &grid, &b, nrhs, &threaded);
    check_solution(&gf, &xt, &b, nrhs, 1e-10);
    for i in 0..n * nrhs {
        assert!(
            (xs[i] - xt[i]).abs() < 1e-10,
            "threaded solve diverges at {i}"
        );
    }
}

/// Permuted solve on one rank: with A = I the output is the input pushed
/// through Pc o Pr, and a 2x2 mesh agrees with the single rank.
#[test]
fn test_permutations_compose() {
    let n = 8;
    let part = SupernodePartition::uniform(n, 2);
    let gf = identity_factors(part);
    let perm_r: Vec<usize> = (0..n).map(|i| (i + 3) % n).collect();
    let perm_c: Vec<usize> = (0..n).map(|i| (i * 3) % n).collect();
    let perms = Permutations { perm_r, perm_c };
    let b: Vec<f64> = (0..n).map(|i| 10.0 + i as f64).collect();

    let (x1, _) = solve_on_mesh_permuted(
        &gf,
        &ProcessGrid::new(1, 1),
        &b,
        1,
        &SolveOptions::default(),
        &perms,
    );
    for i in 0..n {
        assert_eq!(x1[perms.apply(i)], b[i], "Pc o Pr composition broken at {i}");
    }

    let (x4, _) = solve_on_mesh_permuted(
        &gf,
        &ProcessGrid::new(2, 2),
        &b,
        1,
        &SolveOptions::default(),
        &perms,
    );
    assert_eq!(x1, x4);
}

/// Argument validation reports the classic info = -k convention and does
/// no work.
#[test]
fn test_argument_validation() {
    let part = SupernodePartition::uniform(4, 2);
    let gf = random_factors(part, 7, 1.0);
    let n = gf.n();
    let rows = RowDist::block(n, 1);
    let perms = Permutations::identity(n);
    let grid = ProcessGrid::new(1, 1);
    let out = run_mesh(&grid, |rank, mut comm| {
        let factors = distribute_factors(&gf, &grid, rank);
        let plan = build_rank_plan(&gf, &grid, rank, &rows, &perms, 2);
        let mut b = vec![0.0; n];
        let mut stats = SolveStat::default();
        // ldb below m_loc: argument 9.
        let err = solve(
            n, &factors, &gf.part, &perms, &grid, &mut b, n, 0, n - 1, 1, &plan, &mut comm,
            &SolveOptions::default(), &mut stats,
        )
        .unwrap_err();
        err.info()
    });
    assert_eq!(out[0], -9);
}
