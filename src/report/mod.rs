pub mod xlsx;

use anyhow::{Context, Result};
use parquet::{
    arrow::ArrowWriter,
    basic::{Compression, ZstdLevel},
    file::properties::WriterProperties,
};
use serde::Serialize;
use std::{
    fmt::Write as _,
    fs::File,
    io::{BufWriter, Write as _},
    path::Path,
};
use tracing::info;

use crate::{
    diagnostics::CorrelationMatrix,
    load::{LabeledTable, ValueLabels},
    model::LogitFit,
    recode::RecodeSummary,
    tabulate::Descriptives,
};
use xlsx::Cell;

fn fmt_p(p: f64) -> String {
    if p.is_nan() {
        "NA".to_string()
    } else if p < 1e-4 {
        "<0.0001".to_string()
    } else {
        format!("{:.4}", p)
    }
}

/// Rows of the descriptive table: one header, then one row per covariate
/// level with the outcome's column percentages, weighted N, domain mean and
/// CI. The test statistic goes on the first row of each covariate.
pub fn descriptive_rows(d: &Descriptives, labels: &ValueLabels) -> Vec<Vec<Cell>> {
    let outcome_levels = d
        .by_covariate
        .first()
        .map(|(_, s)| s.crosstab.outcome_levels.clone())
        .unwrap_or_default();

    let mut header: Vec<Cell> = vec!["Variable".into(), "Category".into()];
    for code in &outcome_levels {
        header.push(format!("{} (%)", labels.display(&d.outcome, *code)).into());
    }
    for h in ["Weighted N", "Unweighted n", "Mean", "CI low", "CI high", "F", "df", "p-value"] {
        header.push(h.into());
    }

    let mut rows = vec![header];
    rows.push({
        let mut overall: Vec<Cell> = vec!["Overall".into(), "All".into()];
        overall.extend(outcome_levels.iter().map(|_| Cell::Empty));
        overall.extend([
            Cell::from(d.overall.weighted_n),
            Cell::from(d.overall.n as f64),
            Cell::from(d.overall.mean),
            Cell::from(d.overall.ci_low),
            Cell::from(d.overall.ci_high),
        ]);
        overall
    });

    for (column, s) in &d.by_covariate {
        let t = &s.crosstab;
        for (b, level) in t.covariate_levels.iter().enumerate() {
            let mut row: Vec<Cell> = vec![
                if b == 0 { s.label.clone().into() } else { Cell::Empty },
                labels.display(column, *level).into(),
            ];
            for a in 0..t.outcome_levels.len() {
                row.push(t.column_percent[a][b].into());
            }
            row.push(t.column_total(b).into());
            row.push((t.level_n[b] as f64).into());
            match s.means.iter().find(|m| m.level == *level) {
                Some(m) => row.extend([
                    Cell::from(m.estimate.mean),
                    Cell::from(m.estimate.ci_low),
                    Cell::from(m.estimate.ci_high),
                ]),
                None => row.extend([Cell::Empty, Cell::Empty, Cell::Empty]),
            }
            if b == 0 {
                row.push(s.test.f.into());
                row.push(format!("{:.2}, {:.2}", s.test.ndf, s.test.ddf).into());
                row.push(fmt_p(s.test.p_value).into());
            }
            rows.push(row);
        }
    }
    rows
}

/// Fixed-width text rendering of a row table.
pub fn render_rows(rows: &[Vec<Cell>]) -> String {
    let text: Vec<Vec<String>> = rows
        .iter()
        .map(|r| {
            r.iter()
                .map(|c| match c {
                    Cell::Empty => String::new(),
                    Cell::Text(s) => s.clone(),
                    Cell::Number(v) if v.fract() == 0.0 && v.abs() < 1e15 => format!("{:.0}", v),
                    Cell::Number(v) => format!("{:.3}", v),
                })
                .collect()
        })
        .collect();
    let cols = text.iter().map(|r| r.len()).max().unwrap_or(0);
    let widths: Vec<usize> = (0..cols)
        .map(|c| {
            text.iter()
                .filter_map(|r| r.get(c))
                .map(|s| s.chars().count())
                .max()
                .unwrap_or(0)
        })
        .collect();

    let mut out = String::new();
    for row in &text {
        let line: Vec<String> = row
            .iter()
            .enumerate()
            .map(|(c, s)| format!("{:<width$}", s, width = widths[c]))
            .collect();
        let _ = writeln!(out, "{}", line.join("  ").trim_end());
    }
    out
}

pub fn render_recode_summary(s: &RecodeSummary) -> String {
    let mut out = String::from("=== Recode summary ===\n");
    let _ = writeln!(
        out,
        "condom use: used={} not_used={} no_recent_sex={} out_of_domain={} null={}",
        s.used, s.not_used, s.no_recent_sex, s.out_of_domain, s.null_outcome
    );
    let _ = writeln!(
        out,
        "education:  none={} primary_or_higher={} missing={}",
        s.no_education, s.some_education, s.education_missing
    );
    out
}

pub fn render_descriptives(d: &Descriptives, labels: &ValueLabels) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "=== Weighted proportion: {} ===\nmean={:.4} se={:.4} 95% CI=({:.4}, {:.4}) deff={} n={}",
        labels.variable_label(&d.outcome).unwrap_or(&d.outcome),
        d.overall.mean,
        d.overall.se,
        d.overall.ci_low,
        d.overall.ci_high,
        d.overall.deff.map_or("NA".to_string(), |v| format!("{:.3}", v)),
        d.overall.n,
    );
    out.push_str("\n=== Cross-tabulations (column %) ===\n");
    out.push_str(&render_rows(&descriptive_rows(d, labels)));

    out.push_str("\n=== Design-based chi-square tests ===\n");
    for (_, s) in &d.by_covariate {
        let _ = writeln!(
            out,
            "{:<18} Pearson X2={:.3} (df={}, p={})  Rao-Scott F={:.3} on ({:.2}, {:.2}) df, p={}",
            s.label,
            s.test.pearson,
            s.test.df,
            fmt_p(s.test.pearson_p),
            s.test.f,
            s.test.ndf,
            s.test.ddf,
            fmt_p(s.test.p_value),
        );
    }
    out
}

pub fn render_fit(fit: &LogitFit, labels: &ValueLabels) -> String {
    let mut out = String::new();
    let separation = match (fit.separation, fit.separated_terms.is_empty()) {
        (false, _) => String::new(),
        (true, true) => ", SEPARATION".to_string(),
        (true, false) => format!(", SEPARATION in {}", fit.separated_terms.join(", ")),
    };
    let _ = writeln!(
        out,
        "=== Logistic regression: {} (n={}, residual df={}, iterations={}{}{}) ===",
        fit.model,
        fit.n,
        fit.residual_df,
        fit.iterations,
        if fit.converged { "" } else { ", NOT CONVERGED" },
        separation,
    );
    let header = ["Term", "Estimate", "SE", "t", "p", "OR", "OR low", "OR high"];
    let mut rows: Vec<Vec<Cell>> = vec![header.iter().map(|h| Cell::from(*h)).collect()];
    for c in &fit.coefficients {
        let name = match (&c.column, c.level) {
            (Some(col), Some(level)) => format!(
                "{}: {}",
                labels.variable_label(col).unwrap_or(col),
                labels.display(col, level)
            ),
            (Some(col), None) => labels.variable_label(col).unwrap_or(col).to_string(),
            (None, _) => c.name.clone(),
        };
        rows.push(vec![
            name.into(),
            c.estimate.into(),
            c.se.into(),
            c.t.into(),
            fmt_p(c.p_value).into(),
            c.odds_ratio.into(),
            c.or_low.into(),
            c.or_high.into(),
        ]);
    }
    out.push_str(&render_rows(&rows));
    out
}

pub fn render_correlations(m: &CorrelationMatrix) -> String {
    let mut rows: Vec<Vec<Cell>> = Vec::with_capacity(m.columns.len() + 1);
    let mut header = vec![Cell::Empty];
    header.extend(m.columns.iter().map(|c| Cell::from(c.as_str())));
    rows.push(header);
    for (name, values) in m.columns.iter().zip(&m.values) {
        let mut row = vec![Cell::from(name.as_str())];
        row.extend(values.iter().map(|v| {
            if v.is_nan() {
                Cell::from("NA")
            } else {
                Cell::Text(format!("{:.3}", v))
            }
        }));
        rows.push(row);
    }
    format!(
        "=== Covariate correlations (unweighted, n={}) ===\n{}",
        m.n,
        render_rows(&rows)
    )
}

/// Write the analysis table as Parquet for audit.
#[tracing::instrument(level = "info", skip(table), fields(path = %path.display()))]
pub fn write_analysis_table(table: &LabeledTable, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let props = WriterProperties::builder()
        .set_compression(Compression::ZSTD(ZstdLevel::try_new(3)?))
        .build();
    let mut writer = ArrowWriter::try_new(BufWriter::new(file), table.schema(), Some(props))
        .with_context(|| format!("opening Parquet writer for {}", path.display()))?;
    writer
        .write(&table.batch)
        .with_context(|| format!("writing {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing {}", path.display()))?;
    info!(rows = table.num_rows(), "analysis table written");
    Ok(())
}

/// Pretty-printed JSON of any result, with a trailing newline.
#[tracing::instrument(level = "info", skip(value), fields(path = %path.display()))]
pub fn write_json<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut out = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut out, value)
        .with_context(|| format!("serializing {}", path.display()))?;
    out.write_all(b"\n")?;
    out.flush()
        .with_context(|| format!("flushing {}", path.display()))?;
    info!("json written");
    Ok(())
}
