use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use log::{debug, info, warn};
use serde::Serialize;

use super::{
    config::RunConfig,
    error::Result,
    topology::Topology,
    trainer::{Image, Losses},
};

/// Sink for scalar training curves.
pub trait ScalarWriter: Send {
    fn add_scalar(&mut self, tag: &str, value: f32, step: u64) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Sink for image grids.
pub trait ImageWriter: Send {
    /// Writes `images` as one grid with `per_row` images per row.
    fn write_images(&mut self, images: &[Image], per_row: usize, label: &str) -> io::Result<()>;
}

/// Discards everything. Used on ranks that never report.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullWriter;

impl ScalarWriter for NullWriter {
    fn add_scalar(&mut self, _: &str, _: f32, _: u64) -> io::Result<()> {
        Ok(())
    }
}

impl ImageWriter for NullWriter {
    fn write_images(&mut self, _: &[Image], _: usize, _: &str) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Serialize)]
struct ScalarRecord<'a> {
    tag: &'a str,
    value: f32,
    step: u64,
}

/// Appends one JSON object per scalar to `scalars.jsonl`.
#[derive(Debug)]
pub struct JsonlScalarWriter {
    path: PathBuf,
    out: BufWriter<File>,
}

impl JsonlScalarWriter {
    pub const FILE_NAME: &'static str = "scalars.jsonl";

    pub fn create(dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(Self::FILE_NAME);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path,
            out: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ScalarWriter for JsonlScalarWriter {
    fn add_scalar(&mut self, tag: &str, value: f32, step: u64) -> io::Result<()> {
        serde_json::to_writer(&mut self.out, &ScalarRecord { tag, value, step })?;
        self.out.write_all(b"\n")
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

/// Writes each grid as a binary PPM file named after its label.
#[derive(Debug, Clone)]
pub struct PpmImageWriter {
    dir: PathBuf,
}

impl PpmImageWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl ImageWriter for PpmImageWriter {
    fn write_images(&mut self, images: &[Image], per_row: usize, label: &str) -> io::Result<()> {
        let Some(first) = images.first() else {
            return Ok(());
        };
        let (w, h) = (first.width(), first.height());
        if images.iter().any(|i| i.width() != w || i.height() != h) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "all images of a grid must share one size",
            ));
        }

        let per_row = per_row.clamp(1, images.len());
        let rows = images.len().div_ceil(per_row);
        let (grid_w, grid_h) = (per_row * w, rows * h);

        let mut pixels = vec![0u8; grid_w * grid_h * 3];
        for (n, image) in images.iter().enumerate() {
            let (ox, oy) = ((n % per_row) * w, (n / per_row) * h);
            for y in 0..h {
                for x in 0..w {
                    let at = ((oy + y) * grid_w + ox + x) * 3;
                    for (c, v) in image.pixel(x, y).into_iter().enumerate() {
                        pixels[at + c] = to_byte(v);
                    }
                }
            }
        }

        fs::create_dir_all(&self.dir)?;
        let mut out = BufWriter::new(File::create(self.dir.join(format!("{label}.ppm")))?);
        write!(out, "P6\n{grid_w} {grid_h}\n255\n")?;
        out.write_all(&pixels)?;
        out.flush()
    }
}

fn to_byte(v: f32) -> u8 {
    (((v + 1.0) * 0.5).clamp(0.0, 1.0) * 255.0).round() as u8
}

/// What the loop wants reported.
pub enum Report<'a> {
    /// Duration of one completed iteration.
    Progress {
        iteration: u64,
        target: u64,
        elapsed: Duration,
    },
    Losses {
        iteration: u64,
        losses: &'a Losses,
    },
    /// Images are only produced when the report is actually emitted.
    Images {
        label: String,
        produce: Box<dyn FnOnce() -> Result<Vec<Image>> + 'a>,
    },
}

/// Gates every side effect on the reporting rank.
pub struct Reporter {
    rank: usize,
    reporting: bool,
    per_row: usize,
    scalars: Box<dyn ScalarWriter>,
    images: Box<dyn ImageWriter>,
    emitted: u64,
}

impl Reporter {
    pub fn new(
        topology: &Topology,
        per_row: usize,
        scalars: Box<dyn ScalarWriter>,
        images: Box<dyn ImageWriter>,
    ) -> Self {
        Self {
            rank: topology.rank(),
            reporting: topology.is_reporting_rank(),
            per_row,
            scalars,
            images,
            emitted: 0,
        }
    }

    /// File-backed writers on the reporting rank, nothing elsewhere.
    pub fn from_config(config: &RunConfig, topology: &Topology) -> Result<Self> {
        let per_row = config.display_size.get();
        if !topology.is_reporting_rank() {
            return Ok(Self::new(
                topology,
                per_row,
                Box::new(NullWriter),
                Box::new(NullWriter),
            ));
        }

        let scalars = JsonlScalarWriter::create(&config.loss_dir())?;
        debug!("writing scalars to {}", scalars.path().display());
        Ok(Self::new(
            topology,
            per_row,
            Box::new(scalars),
            Box::new(PpmImageWriter::new(config.image_dir())),
        ))
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.rank
    }

    #[inline]
    pub fn is_reporting_rank(&self) -> bool {
        self.reporting
    }

    /// Number of reports that reached a writer or the log.
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Emits `report` on the reporting rank and returns whether it did.
    ///
    /// Writer failures are logged and swallowed; only a failing image
    /// producer is an error.
    pub fn report(&mut self, report: Report<'_>) -> Result<bool> {
        if !self.reporting {
            return Ok(false);
        }

        match report {
            Report::Progress {
                iteration,
                target,
                elapsed,
            } => {
                let ms = elapsed.as_millis();
                debug!(
                    "Iteration {iteration:08}/{target:08} completed in {}m {}s {}ms",
                    ms / 60_000,
                    ms / 1000 % 60,
                    ms % 1000
                );
            }
            Report::Losses { iteration, losses } => {
                let line = losses
                    .iter()
                    .map(|(name, value)| format!("{name}={value:.4}"))
                    .collect::<Vec<_>>()
                    .join(" ");
                info!(iteration = iteration; "{line}");

                let written = losses
                    .iter()
                    .try_for_each(|(name, value)| self.scalars.add_scalar(name, value, iteration))
                    .and_then(|_| self.scalars.flush());
                if let Err(e) = written {
                    warn!("could not write losses at iteration {iteration}: {e}");
                }
            }
            Report::Images { label, produce } => {
                let images = produce()?;
                if let Err(e) = self.images.write_images(&images, self.per_row, &label) {
                    warn!("could not write images {label}: {e}");
                }
            }
        }

        self.emitted += 1;
        Ok(true)
    }
}
