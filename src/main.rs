//! Command-line entry point: read an annotation and a name-grouped
//! alignment file, run EM to reassign ambiguous fragments, and write a
//! report (plus, optionally, a checkpoint and an updated alignment file).
//!
//! Grounded on `main.py`'s `id` subcommand and `telescope_id.py`'s
//! `run_telescope_id` orchestration. The `tag`/`load` subcommands of the
//! original tool are out of scope (see `DESIGN.md`).

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use telescope_rs::annotation::{read_records, AnnotationIndex, SortedArrayIndex};
use telescope_rs::checkpoint::Checkpoint;
use telescope_rs::config::CoreConfig;
use telescope_rs::ingest::BamIngester;
use telescope_rs::output::UpdatedAlignmentWriter;
use telescope_rs::{em, report, SparseMatrix};

/// Reassign ambiguously-mapped sequencing fragments to annotated loci.
#[derive(Parser, Debug)]
#[command(name = "telescope-rs", version, about = "Probabilistic reassignment of multi-mapped reads to repetitive loci")]
struct Cli {
    /// Path to a name-grouped alignment file (SAM/BAM/CRAM).
    samfile: PathBuf,
    /// Path to an annotation file (GTF format).
    gtffile: PathBuf,

    /// GTF attribute carrying locus identity.
    #[arg(long, default_value = "locus")]
    gtf_attr_name: String,
    /// Reserved locus id for fragments mapped but unannotated.
    #[arg(long, default_value = "__nofeature__")]
    no_feature_key: String,

    /// Print per-iteration EM convergence deltas.
    #[arg(long)]
    verbose: bool,
    /// Directory to write outputs into.
    #[arg(long, default_value = ".")]
    outdir: PathBuf,
    /// Experiment tag, used as a filename prefix.
    #[arg(long, default_value = "telescope")]
    exp_tag: String,
    /// Dump the raw (pre-EM) score matrix as a checkpoint alongside the report.
    #[arg(long)]
    out_matrix: bool,
    /// Write a re-tagged copy of the alignment reflecting the final assignment.
    #[arg(long)]
    updated_sam: bool,
    /// Write periodic checkpoints during the EM run.
    #[arg(long)]
    checkpoint: bool,
    /// Iterations between checkpoints.
    #[arg(long, default_value_t = 10)]
    checkpoint_interval: usize,
    /// Minimum posterior probability for inclusion in the updated alignment file.
    #[arg(long, default_value_t = 0.2)]
    min_prob: f64,
    /// Minimum probability for a high-confidence assignment.
    #[arg(long, default_value_t = 0.9)]
    conf_prob: f64,

    /// Pi prior, equivalent to adding n unique reads.
    #[arg(long = "pi-prior", default_value_t = 0)]
    pi_prior: u32,
    /// Theta prior, equivalent to adding n non-unique reads.
    #[arg(long = "theta-prior", default_value_t = 0)]
    theta_prior: u32,

    /// EM convergence epsilon.
    #[arg(long = "em-epsilon", default_value_t = 1e-7)]
    em_epsilon: f64,
    /// Maximum EM iterations.
    #[arg(long = "max-iter", default_value_t = 100)]
    max_iter: usize,
}

impl Cli {
    fn config(&self) -> CoreConfig {
        CoreConfig {
            locus_attr_name: self.gtf_attr_name.clone(),
            no_feature_key: self.no_feature_key.clone(),
            min_prob: self.min_prob,
            conf_prob: self.conf_prob,
            pi_prior: self.pi_prior,
            theta_prior: self.theta_prior,
            em_epsilon: self.em_epsilon,
            max_iter: self.max_iter,
            checkpoint_interval: self.checkpoint_interval,
            verbose: self.verbose,
        }
    }

    fn out_path(&self, suffix: &str) -> PathBuf {
        self.outdir.join(format!("{}-{}", self.exp_tag, suffix))
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("telescope_rs=debug")
    } else {
        EnvFilter::new("telescope_rs=info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = cli.config();
    std::fs::create_dir_all(&cli.outdir)
        .with_context(|| format!("failed to create output directory {}", cli.outdir.display()))?;

    if config.locus_attr_name == config.no_feature_key {
        anyhow::bail!("--no-feature-key must not collide with --gtf-attr-name's value space");
    }

    let annotation = load_annotation(&cli.gtffile, &config.locus_attr_name)
        .with_context(|| format!("failed to build annotation index from {}", cli.gtffile.display()))?;
    tracing::info!(loci = annotation.locus_count(), "annotation index built");

    let ingested = BamIngester::run(&cli.samfile, &annotation, cli.updated_sam, |stats| {
        tracing::info!(
            unmapped = stats.unmapped,
            nofeat = stats.nofeat,
            mapped = stats.mapped,
            "ingest progress"
        );
    })
    .with_context(|| format!("failed to ingest alignments from {}", cli.samfile.display()))?;

    let raw = SparseMatrix::from_triplets(ingested.row_names.len(), annotation.locus_count(), ingested.triplets);

    if cli.out_matrix {
        write_matrix_checkpoint(&cli, &ingested.row_names, &annotation, &raw, "initial-matrix.tckpt")?;
    }

    let outdir = cli.outdir.clone();
    let exp_tag = cli.exp_tag.clone();
    let checkpoint_enabled = cli.checkpoint;
    let row_names = ingested.row_names.clone();
    let locus_ids: Vec<String> = annotation.locus_ids().to_vec();

    let mut on_checkpoint = move |iter: usize, result: &em::EmResult, q: &SparseMatrix| -> std::io::Result<()> {
        if !checkpoint_enabled {
            return Ok(());
        }
        let ckpt = Checkpoint {
            row_names: row_names.clone(),
            col_names: locus_ids.clone(),
            q: q.clone(),
            pi0: result.pi0.clone(),
            pi: result.pi.clone(),
            theta: result.theta.clone(),
            x_hat: result.x_hat.clone(),
        };
        let path = outdir.join(format!("{exp_tag}-checkpoint.{iter:05}.tckpt"));
        let mut w = BufWriter::new(File::create(&path)?);
        ckpt.write(&mut w)
    };

    let em_callback: Option<&mut dyn FnMut(usize, &em::EmResult, &SparseMatrix) -> std::io::Result<()>> =
        if cli.checkpoint { Some(&mut on_checkpoint) } else { None };

    let em_result = em::run(raw, &config, em_callback).context("EM run failed")?;
    tracing::info!(iterations = em_result.iterations, "EM converged");

    if cli.checkpoint {
        let ckpt = Checkpoint {
            row_names: ingested.row_names.clone(),
            col_names: annotation.locus_ids().to_vec(),
            q: em_result.q.clone(),
            pi0: em_result.pi0.clone(),
            pi: em_result.pi.clone(),
            theta: em_result.theta.clone(),
            x_hat: em_result.x_hat.clone(),
        };
        let path = cli.out_path("checkpoint.final.tckpt");
        let mut w = BufWriter::new(File::create(&path).with_context(|| format!("failed to create {}", path.display()))?);
        ckpt.write(&mut w).with_context(|| format!("failed to write checkpoint {}", path.display()))?;
    }

    let report = report::build(&em_result, annotation.locus_ids(), config.conf_prob, Some(&ingested.alt_counts));
    let report_path = cli.out_path("telescope_report.tsv");
    let mut w = BufWriter::new(File::create(&report_path).with_context(|| format!("failed to create {}", report_path.display()))?);
    report.write_tsv(&mut w).with_context(|| format!("failed to write report {}", report_path.display()))?;
    tracing::info!(path = %report_path.display(), "report written");

    if cli.updated_sam {
        let (Some(fragments), Some(store)) = (ingested.fragments, ingested.store) else {
            anyhow::bail!("updated alignment requested but fragments were not retained during ingest");
        };
        let updated_path = cli.out_path("updated.bam");
        let mut writer = UpdatedAlignmentWriter::create(&updated_path, &ingested.header)
            .with_context(|| format!("failed to open {}", updated_path.display()))?;

        for (row, fragment) in fragments.iter().enumerate() {
            if let Err(e) = writer.write_fragment(row, fragment, &em_result.x_hat, &annotation, &store, &config) {
                tracing::warn!(fragment = %fragment.name, error = %e, "failed to write updated alignment record, skipping");
            }
        }
        tracing::info!(path = %updated_path.display(), "updated alignment written");
    }

    Ok(())
}

fn load_annotation(gtf_path: &Path, attr_name: &str) -> Result<SortedArrayIndex> {
    let reader = BufReader::new(File::open(gtf_path)?);
    let records = read_records(reader)?;
    Ok(SortedArrayIndex::build(&records, attr_name)?)
}

fn write_matrix_checkpoint(
    cli: &Cli,
    row_names: &[String],
    annotation: &SortedArrayIndex,
    raw: &SparseMatrix,
    suffix: &str,
) -> Result<()> {
    let ckpt = Checkpoint {
        row_names: row_names.to_vec(),
        col_names: annotation.locus_ids().to_vec(),
        q: raw.clone(),
        pi0: Vec::new(),
        pi: Vec::new(),
        theta: Vec::new(),
        x_hat: raw.clone(),
    };
    let path = cli.out_path(suffix);
    let mut w = BufWriter::new(File::create(&path).with_context(|| format!("failed to create {}", path.display()))?);
    ckpt.write(&mut w).with_context(|| format!("failed to write {}", path.display()))
}
