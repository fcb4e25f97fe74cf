//! Demo driver: build a random factored system, solve it on an
//! in-process Pr x Pc mesh, and report the residual and per-rank
//! statistics.

use std::process::ExitCode;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tri_core::dense::gemm;
use tri_core::prelude::*;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_help() {
    println!(
        r#"trisolve demo driver

USAGE:
    tri-cli [OPTIONS]

OPTIONS:
    -h, --help              Print help information
    -V, --version           Print version information
    -n <N>                  Matrix order (default: 64)
    -s, --super <S>         Supernode size (default: 4)
    -g, --grid <PRxPC>      Process mesh, e.g. 2x2 (default: 2x2)
    -r, --nrhs <K>          Number of right-hand sides (default: 1)
    -d, --density <D>       Off-diagonal fill probability (default: 0.5)
    -t, --transport <T>     two-sided or one-sided (default: two-sided)
    -j, --threads <T>       Intra-rank threads (default: 1)
    --trsm                  Solve diagonal blocks by TRSM instead of the
                            precomputed inverses
    --seed <S>              RNG seed (default: 42)

EXAMPLES:
    tri-cli -n 256 -s 8 -g 2x4 -r 4
    tri-cli -g 1x1 --trsm               # serial, no communication
    tri-cli -t one-sided -j 4           # RMA-style windows, 4 threads/rank
"#
    );
}

struct Args {
    n: usize,
    super_size: usize,
    nprow: usize,
    npcol: usize,
    nrhs: usize,
    density: f64,
    options: SolveOptions,
    seed: u64,
}

fn parse_args() -> std::result::Result<Option<Args>, String> {
    let mut args = Args {
        n: 64,
        super_size: 4,
        nprow: 2,
        npcol: 2,
        nrhs: 1,
        density: 0.5,
        options: SolveOptions::default(),
        seed: 42,
    };
    let argv: Vec<String> = std::env::args().skip(1).collect();
    let mut i = 0;
    let value = |i: &mut usize| -> std::result::Result<String, String> {
        *i += 1;
        argv.get(*i)
            .cloned()
            .ok_or_else(|| format!("missing value for {}", argv[*i - 1]))
    };
    while i < argv.len() {
        match argv[i].as_str() {
            "-h" | "--help" => {
                print_help();
                return Ok(None);
            }
            "-V" | "--version" => {
                println!("trisolve {VERSION}");
                return Ok(None);
            }
            "-n" => args.n = parse_num(&value(&mut i)?)?,
            "-s" | "--super" => args.super_size = parse_num(&value(&mut i)?)?,
            "-g" | "--grid" => {
                let v = value(&mut i)?;
                let (pr, pc) = v
                    .split_once('x')
                    .ok_or_else(|| format!("bad grid spec '{v}', expected PRxPC"))?;
                args.nprow = parse_num(pr)?;
                args.npcol = parse_num(pc)?;
            }
            "-r" | "--nrhs" => args.nrhs = parse_num(&value(&mut i)?)?,
            "-d" | "--density" => {
                args.density = value(&mut i)?
                    .parse::<f64>()
                    .map_err(|e| format!("bad density: {e}"))?;
            }
            "-t" | "--transport" => {
                args.options.transport = match value(&mut i)?.as_str() {
                    "two-sided" => TransportKind::TwoSided,
                    "one-sided" => TransportKind::OneSided,
                    other => return Err(format!("unknown transport '{other}'")),
                };
            }
            "-j" | "--threads" => args.options.threads = parse_num(&value(&mut i)?)?,
            "--trsm" => args.options.use_inverse_diagonals = false,
            "--seed" => args.seed = parse_num(&value(&mut i)?)? as u64,
            other => return Err(format!("unknown option '{other}' (try --help)")),
        }
        i += 1;
    }
    if args.n == 0 || args.super_size == 0 || args.nprow == 0 || args.npcol == 0 {
        return Err("n, supernode size and grid dimensions must be positive".into());
    }
    Ok(Some(args))
}

fn parse_num(s: &str) -> std::result::Result<usize, String> {
    s.parse::<usize>().map_err(|e| format!("bad number '{s}': {e}"))
}

/// Random unit-lower / upper factor pair with a dominant diagonal.
fn random_factors(part: SupernodePartition, seed: u64, density: f64) -> GlobalFactors {
    let n = part.n();
    let mut rng = StdRng::seed_from_u64(seed);
    let mut l = vec![0.0; n * n];
    let mut u = vec![0.0; n * n];
    let scale = 1.0 / n as f64;
    for j in 0..n {
        l[j + j * n] = 1.0;
        u[j + j * n] = 2.0 + rng.gen::<f64>();
        for i in j + 1..n {
            if rng.gen::<f64>() < density {
                l[i + j * n] = rng.gen_range(-1.0..1.0) * scale;
            }
        }
        for i in 0..j {
            if rng.gen::<f64>() < density {
                u[i + j * n] = rng.gen_range(-1.0..1.0) * scale;
            }
        }
    }
    GlobalFactors { part, l, u }
}

fn run(args: &Args) -> std::result::Result<(), String> {
    let n = args.n;
    let nrhs = args.nrhs;
    let grid = ProcessGrid::new(args.nprow, args.npcol);
    let part = SupernodePartition::uniform(n, args.super_size);
    let gf = random_factors(part, args.seed, args.density);

    // B = A * X_true with X_true = all ones.
    let xtrue = vec![1.0; n * nrhs];
    let mut ux = vec![0.0; n * nrhs];
    let mut b_global = vec![0.0; n * nrhs];
    gemm(n, nrhs, n, 1.0, &gf.u, n, &xtrue, n, 0.0, &mut ux, n);
    gemm(n, nrhs, n, 1.0, &gf.l, n, &ux, n, 0.0, &mut b_global, n);

    let rows = RowDist::block(n, grid.nprocs());
    let perms = Permutations::identity(n);
    println!(
        "solving n={n} nrhs={nrhs} on a {}x{} mesh ({} supernodes, {:?})",
        args.nprow,
        args.npcol,
        gf.part.nsupers(),
        args.options.transport,
    );

    let results = run_mesh(&grid, |rank, mut comm| {
        let mut factors = distribute_factors(&gf, &grid, rank);
        compute_diag_inverses(&mut factors)?;
        let plan = build_rank_plan(&gf, &grid, rank, &rows, &perms, args.options.tree_fanout);
        let m_loc = rows.m_loc(rank);
        let fst = rows.fst_row[rank];
        let ldb = m_loc.max(1);
        let mut b_loc = vec![0.0; ldb * nrhs];
        for j in 0..nrhs {
            for i in 0..m_loc {
                b_loc[i + j * ldb] = b_global[fst + i + j * n];
            }
        }
        let mut stats = SolveStat::default();
        solve(
            n,
            &factors,
            &gf.part,
            &perms,
            &grid,
            &mut b_loc,
            m_loc,
            fst,
            ldb,
            nrhs,
            &plan,
            &mut comm,
            &args.options,
            &mut stats,
        )?;
        Ok::<_, SolveError>((b_loc, m_loc, fst, stats))
    });

    let mut x = vec![0.0; n * nrhs];
    for res in &results {
        let (b_loc, m_loc, fst, stats) = res.as_ref().map_err(|e| e.to_string())?;
        let ldb = (*m_loc).max(1);
        for j in 0..nrhs {
            for i in 0..*m_loc {
                x[fst + i + j * n] = b_loc[i + j * ldb];
            }
        }
        log::info!(
            "rank stats: {} ops, {} msgs out, {} msgs in",
            stats.solve_ops,
            stats.msgs_sent,
            stats.msgs_recv
        );
    }

    let max_err = x
        .iter()
        .map(|&v| (v - 1.0).abs())
        .fold(0.0, f64::max);
    let total: SolveStat = results
        .iter()
        .fold(SolveStat::default(), |mut acc, r| {
            if let Ok((_, _, _, s)) = r {
                acc.solve_ops += s.solve_ops;
                acc.msgs_sent += s.msgs_sent;
                acc.msgs_recv += s.msgs_recv;
                acc.t_total = acc.t_total.max(s.t_total);
            }
            acc
        });
    println!("max |x - 1|      {max_err:.3e}");
    println!("solve ops        {}", total.solve_ops);
    println!(
        "messages         {} sent / {} received",
        total.msgs_sent, total.msgs_recv
    );
    println!("wall time        {:.4}s", total.t_total.as_secs_f64());

    if max_err > 1e-8 {
        return Err(format!("solution error {max_err:.3e} exceeds tolerance"));
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    match parse_args() {
        Ok(Some(args)) => match run(&args) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("error: {e}");
                ExitCode::FAILURE
            }
        },
        Ok(None) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            eprintln!("try 'tri-cli --help'");
            ExitCode::FAILURE
        }
    }
}
