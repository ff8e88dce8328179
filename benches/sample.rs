use std::collections::HashMap;
use std::convert::Infallible;

use cosmo_mcmc::{
    proposal_basis, ChainDriver, ChainSettings, CovarianceMatrix, GaussianLikelihood, JumpStrategy,
    LikelihoodEvaluator, MemoryWriter, Parameter, ParameterStore, ProposalGenerator, Solver,
    SolverFailure, SolverOutput,
};
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use faer::Mat;
use rand::SeedableRng;

#[derive(Debug)]
struct NeverFails(Infallible);

impl std::fmt::Display for NeverFails {
    fn fmt(&self, _: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {}
    }
}

impl std::error::Error for NeverFails {}

impl SolverFailure for NeverFails {
    fn is_recoverable(&self) -> bool {
        match self.0 {}
    }
}

struct Identity;

impl Solver for Identity {
    type Err = NeverFails;

    fn compute(&mut self, arguments: &[(String, f64)]) -> Result<SolverOutput, NeverFails> {
        Ok(arguments.iter().cloned().collect::<HashMap<_, _>>())
    }

    fn reset(&mut self, _stages: &[&str]) {}
}

fn make_store(dim: usize) -> ParameterStore {
    ParameterStore::new(
        (0..dim)
            .map(|i| Parameter::varying(format!("p{i}"), 0., 1. + i as f64 / dim as f64))
            .collect(),
    )
    .unwrap()
}

fn make_covariance(dim: usize) -> CovarianceMatrix {
    // Reversed names force a full reordering.
    let names = (0..dim).rev().map(|i| format!("p{i}")).collect();
    let matrix = Mat::from_fn(dim, dim, |i, j| if i == j { 2. } else { 0.5 });
    CovarianceMatrix::new(names, matrix).unwrap()
}

fn run_chain(dim: usize, num_steps: u64, jumping: JumpStrategy) -> u64 {
    let names: Vec<String> = (0..dim).map(|i| format!("p{i}")).collect();
    let cov = Mat::from_fn(dim, dim, |i, j| if i == j { 1. } else { 0. });
    let likelihood = GaussianLikelihood::new("normal", names, vec![3.; dim], &cov).unwrap();
    let evaluator = LikelihoodEvaluator::new(Identity, vec![Box::new(likelihood)]);
    let settings = ChainSettings {
        num_steps,
        jumping,
        seed: Some(42),
        ..Default::default()
    };
    let mut driver = ChainDriver::new(settings, make_store(dim), evaluator, MemoryWriter::new());
    driver.run().unwrap().accepted
}

fn criterion_benchmark(c: &mut Criterion) {
    for dim in [10, 100] {
        let store = make_store(dim);
        let cov = make_covariance(dim);
        c.bench_function(&format!("proposal basis {dim}"), |b| {
            b.iter(|| proposal_basis(black_box(&store), black_box(Some(&cov))).unwrap())
        });

        let basis = proposal_basis(&store, Some(&cov)).unwrap();
        for jumping in [JumpStrategy::Global, JumpStrategy::Sequential] {
            let generator = ProposalGenerator::new(basis.clone(), jumping, 2.4);
            c.bench_function(&format!("propose {jumping:?} {dim}"), |b| {
                b.iter_batched(
                    || (make_store(dim), rand::rngs::StdRng::seed_from_u64(42)),
                    |(mut store, mut rng)| {
                        for index in 0..100 {
                            black_box(generator.propose(&mut store, index, &mut rng));
                        }
                    },
                    BatchSize::SmallInput,
                )
            });
        }
    }

    c.bench_function("chain normal 10", |b| {
        b.iter(|| run_chain(black_box(10), 1000, JumpStrategy::Global))
    });
    c.bench_function("chain normal 10 sequential", |b| {
        b.iter(|| run_chain(black_box(10), 1000, JumpStrategy::Sequential))
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
