use std::collections::BTreeMap;
use std::fmt;

use chrono_tz::Tz;

use crate::models::Timestamp;
use crate::weather::WeatherError;

/// Weather columns understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WeatherVar {
    TempAir,
    Wind,
    Ghi,
    Dni,
    Dhi,
    CloudCover,
}

impl WeatherVar {
    /// Columns the day simulation cannot run without.
    pub const REQUIRED: [WeatherVar; 5] = [
        WeatherVar::TempAir,
        WeatherVar::Wind,
        WeatherVar::Ghi,
        WeatherVar::Dni,
        WeatherVar::Dhi,
    ];

    pub fn column(self) -> &'static str {
        match self {
            WeatherVar::TempAir => "temp_air_c",
            WeatherVar::Wind => "wind_ms",
            WeatherVar::Ghi => "ghi_wm2",
            WeatherVar::Dni => "dni_wm2",
            WeatherVar::Dhi => "dhi_wm2",
            WeatherVar::CloudCover => "cloudcover",
        }
    }
}

impl fmt::Display for WeatherVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

/// Columnar weather series for one location, indexed by aware timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct WeatherFrame {
    tz: Tz,
    index: Vec<Timestamp>,
    columns: BTreeMap<WeatherVar, Vec<Option<f64>>>,
}

impl WeatherFrame {
    pub fn new(tz: Tz, index: Vec<Timestamp>) -> Self {
        Self {
            tz,
            index,
            columns: BTreeMap::new(),
        }
    }

    pub fn from_columns(
        tz: Tz,
        index: Vec<Timestamp>,
        columns: Vec<(WeatherVar, Vec<Option<f64>>)>,
    ) -> Result<Self, WeatherError> {
        let mut frame = Self::new(tz, index);
        for (var, values) in columns {
            frame.set_column(var, values)?;
        }
        Ok(frame)
    }

    pub fn set_column(
        &mut self,
        var: WeatherVar,
        values: Vec<Option<f64>>,
    ) -> Result<(), WeatherError> {
        if values.len() != self.index.len() {
            return Err(WeatherError::LengthMismatch {
                column: var.column(),
                expected: self.index.len(),
                got: values.len(),
            });
        }
        self.columns.insert(var, values);
        Ok(())
    }

    pub fn tz(&self) -> Tz {
        self.tz
    }

    pub fn index(&self) -> &[Timestamp] {
        &self.index
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn column(&self, var: WeatherVar) -> Option<&[Option<f64>]> {
        self.columns.get(&var).map(Vec::as_slice)
    }

    pub fn has(&self, var: WeatherVar) -> bool {
        self.columns.contains_key(&var)
    }

    pub fn vars(&self) -> impl Iterator<Item = WeatherVar> + '_ {
        self.columns.keys().copied()
    }

    pub fn missing(&self, required: &[WeatherVar]) -> Vec<WeatherVar> {
        required.iter().copied().filter(|v| !self.has(*v)).collect()
    }

    /// Value at a row, `None` when the column is absent or the cell is empty.
    pub fn value(&self, var: WeatherVar, row: usize) -> Option<f64> {
        self.columns
            .get(&var)
            .and_then(|col| col.get(row).copied().flatten())
    }

    /// Rows with `start <= ts < end`, sorted by timestamp.
    pub fn window(&self, start: &Timestamp, end: &Timestamp) -> WeatherFrame {
        let mut rows: Vec<usize> = (0..self.index.len())
            .filter(|&i| self.index[i] >= *start && self.index[i] < *end)
            .collect();
        rows.sort_by_key(|&i| self.index[i]);
        self.select(&rows)
    }

    /// Copy of the frame with rows re-ordered chronologically.
    pub fn sorted(&self) -> WeatherFrame {
        let mut rows: Vec<usize> = (0..self.index.len()).collect();
        rows.sort_by_key(|&i| self.index[i]);
        self.select(&rows)
    }

    fn select(&self, rows: &[usize]) -> WeatherFrame {
        WeatherFrame {
            tz: self.tz,
            index: rows.iter().map(|&i| self.index[i]).collect(),
            columns: self
                .columns
                .iter()
                .map(|(var, col)| (*var, rows.iter().map(|&i| col[i]).collect()))
                .collect(),
        }
    }

    /// Frame restricted to the given columns; absent ones are skipped.
    pub fn project(&self, vars: &[WeatherVar]) -> WeatherFrame {
        WeatherFrame {
            tz: self.tz,
            index: self.index.clone(),
            columns: self
                .columns
                .iter()
                .filter(|(var, _)| vars.contains(var))
                .map(|(var, col)| (*var, col.clone()))
                .collect(),
        }
    }

    /// Copy with all timestamps expressed in `tz`.
    pub fn with_timezone(&self, tz: Tz) -> WeatherFrame {
        WeatherFrame {
            tz,
            index: self.index.iter().map(|t| t.with_timezone(&tz)).collect(),
            columns: self.columns.clone(),
        }
    }
}
