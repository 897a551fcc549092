use anyhow::{ensure, Result};
use genboard::{generation_unit, GenerationContext, GenerationUnit};
use tracing::debug;

pub const MAP_SETTINGS: &str = "mapSettings";
pub const HEIGHT_MAP: &str = "heightMap";
pub const BIOMES: &str = "biomes";
pub const COLOR_MAP: &str = "colorMap";

#[derive(Debug, Clone, Copy)]
pub struct MapSettings {
    pub width: usize,
    pub height: usize,
    pub sea_level: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Biome {
    Ocean,
    Beach,
    Grassland,
    Forest,
    Mountain,
}

impl Biome {
    fn color(self) -> [u8; 3] {
        match self {
            Biome::Ocean => [28, 64, 140],
            Biome::Beach => [222, 206, 150],
            Biome::Grassland => [110, 170, 70],
            Biome::Forest => [40, 110, 45],
            Biome::Mountain => [130, 125, 120],
        }
    }
}

/// A row-major grid of values
#[derive(Debug, Clone)]
pub struct Grid<T> {
    pub width: usize,
    pub height: usize,
    pub cells: Vec<T>,
}

impl<T: Copy> Grid<T> {
    pub fn at(&self, x: usize, y: usize) -> T {
        self.cells[y * self.width + x]
    }
}

#[generation_unit(priority = 0, no_requirement)]
#[derive(Default)]
pub struct Settings;

impl GenerationUnit for Settings {
    fn on_generate(&mut self, ctx: &GenerationContext) -> Result<()> {
        ctx.set(
            MAP_SETTINGS,
            MapSettings {
                width: 48,
                height: 24,
                sea_level: 0.42,
            },
        );
        ctx.mark_complete();
        Ok(())
    }
}

/// Value noise over a coarse lattice, bilinearly interpolated
#[generation_unit(priority = 1, requires = ["mapSettings"], dedicated_worker)]
#[derive(Default)]
pub struct HeightMap {
    lattice: Vec<f32>,
}

const LATTICE: usize = 8;

impl GenerationUnit for HeightMap {
    fn on_registrate(&mut self, mut rng: fastrand::Rng) {
        self.lattice = (0..(LATTICE + 1) * (LATTICE + 1)).map(|_| rng.f32()).collect();
    }

    fn on_generate(&mut self, ctx: &GenerationContext) -> Result<()> {
        let settings = ctx.get::<MapSettings>(MAP_SETTINGS)?;
        ensure!(settings.width > 1 && settings.height > 1, "map is too small");

        let mut cells = Vec::with_capacity(settings.width * settings.height);
        for y in 0..settings.height {
            for x in 0..settings.width {
                let fx = x as f32 / (settings.width - 1) as f32 * LATTICE as f32;
                let fy = y as f32 / (settings.height - 1) as f32 * LATTICE as f32;
                cells.push(self.sample(fx, fy));
            }
        }
        debug!(cells = cells.len(), "Height map sampled");

        ctx.set(
            HEIGHT_MAP,
            Grid {
                width: settings.width,
                height: settings.height,
                cells,
            },
        );
        ctx.mark_complete();
        Ok(())
    }
}

impl HeightMap {
    fn sample(&self, fx: f32, fy: f32) -> f32 {
        let x0 = (fx.floor() as usize).min(LATTICE - 1);
        let y0 = (fy.floor() as usize).min(LATTICE - 1);
        let (tx, ty) = (fx - x0 as f32, fy - y0 as f32);
        let corner = |x: usize, y: usize| self.lattice[y * (LATTICE + 1) + x];

        let top = corner(x0, y0) * (1.0 - tx) + corner(x0 + 1, y0) * tx;
        let bottom = corner(x0, y0 + 1) * (1.0 - tx) + corner(x0 + 1, y0 + 1) * tx;
        top * (1.0 - ty) + bottom * ty
    }
}

#[generation_unit(priority = 2, requires = ["heightMap"], after = ["settings"])]
#[derive(Default)]
pub struct Biomes;

impl GenerationUnit for Biomes {
    fn on_generate(&mut self, ctx: &GenerationContext) -> Result<()> {
        let settings = ctx.get::<MapSettings>(MAP_SETTINGS)?;
        let heights = ctx.get::<Grid<f32>>(HEIGHT_MAP)?;
        let mut rng = ctx.rng();

        let cells: Vec<Biome> = heights
            .cells
            .iter()
            .map(|&height| {
                let above = height - settings.sea_level;
                if above < 0.0 {
                    Biome::Ocean
                } else if above < 0.04 {
                    Biome::Beach
                } else if above > 0.35 {
                    Biome::Mountain
                } else if rng.f32() < 0.4 + above {
                    Biome::Forest
                } else {
                    Biome::Grassland
                }
            })
            .collect();

        ctx.set(
            BIOMES,
            Grid {
                width: heights.width,
                height: heights.height,
                cells,
            },
        );
        ctx.mark_complete();
        Ok(())
    }
}

#[generation_unit(priority = 3, requires = ["biomes", "heightMap"])]
#[derive(Default)]
pub struct ColorMap;

impl GenerationUnit for ColorMap {
    fn on_generate(&mut self, ctx: &GenerationContext) -> Result<()> {
        let biomes = ctx.get::<Grid<Biome>>(BIOMES)?;
        let heights = ctx.get::<Grid<f32>>(HEIGHT_MAP)?;

        let cells: Vec<[u8; 3]> = biomes
            .cells
            .iter()
            .zip(&heights.cells)
            .map(|(biome, height)| {
                let shade = 0.75 + height * 0.25;
                biome.color().map(|channel| (channel as f32 * shade).min(255.0) as u8)
            })
            .collect();

        ctx.set(
            COLOR_MAP,
            Grid {
                width: biomes.width,
                height: biomes.height,
                cells,
            },
        );
        ctx.mark_complete();
        Ok(())
    }
}

/// One character per cell, for the terminal
pub fn render(biomes: &Grid<Biome>) -> String {
    let mut out = String::with_capacity((biomes.width + 1) * biomes.height);
    for y in 0..biomes.height {
        for x in 0..biomes.width {
            out.push(match biomes.at(x, y) {
                Biome::Ocean => '~',
                Biome::Beach => '.',
                Biome::Grassland => '"',
                Biome::Forest => '^',
                Biome::Mountain => 'A',
            });
        }
        out.push('\n');
    }
    out
}
