//! 运行结果.

use brats_berry::pipeline::TrainingSummary;
use brats_berry::predict::PredictionReport;
use std::io::{self, Write};

const S4: &str = "    ";

#[inline]
fn f32_to_display(f: Option<f32>) -> String {
    match f {
        Some(f) => format!("{f:.6}"),
        None => "/".to_string(),
    }
}

/// 将训练汇总写进 `w` 中.
pub fn describe_training_into<W: Write>(s: &TrainingSummary, w: &mut W) -> io::Result<()> {
    let h = &s.history;
    writeln!(w, "Training summary:")?;
    writeln!(w, "{S4}Subjects: {}", s.n_subjects)?;
    writeln!(w, "{S4}Dataset rebuilt: {}", s.dataset_built)?;
    writeln!(
        w,
        "{S4}Steps per epoch: {} training, {} validation",
        s.n_training_steps, s.n_validation_steps
    )?;
    writeln!(w, "{S4}Epochs run: {}", h.epochs.len())?;
    writeln!(w, "{S4}Stopped early: {}", h.stopped_early)?;
    match h.best() {
        Some(best) => {
            writeln!(w, "{S4}Best epoch: {}", best.epoch)?;
            writeln!(w, "{S4}Best loss: {:.6}", best.loss)?;
            write!(w, "{S4}Best val_loss: {}", f32_to_display(best.val_loss))?;
        }
        None => write!(w, "{S4}No epoch improved the monitored loss")?,
    }
    Ok(())
}

/// 将预测汇总写进 `w` 中.
pub fn describe_prediction_into<W: Write>(r: &PredictionReport, w: &mut W) -> io::Result<()> {
    writeln!(w, "Prediction summary:")?;
    writeln!(w, "{S4}Succeeded: {}", r.succeeded.len())?;
    for s in &r.succeeded {
        writeln!(w, "{S4}{S4}{} -> {}", s.subject, s.path.display())?;
    }
    write!(w, "{S4}Failed: {}", r.failed.len())?;
    for f in &r.failed {
        write!(w, "\n{S4}{S4}{}: {}", f.subject, f.reason)?;
    }
    Ok(())
}

/// 打印到标准输出, 前后加分隔线.
pub fn print_with<F>(f: F) -> io::Result<()>
where
    F: FnOnce(&mut Vec<u8>) -> io::Result<()>,
{
    let mut buf = Vec::with_capacity(512);
    f(&mut buf)?;
    let mut out = io::stdout().lock();
    utils::sep_to(&mut out)?;
    out.write_all(&buf)?;
    writeln!(out)?;
    utils::sep_to(&mut out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use brats_berry::predict::{FailedSubject, PredictedSubject};
    use std::path::PathBuf;

    #[test]
    fn test_describe_prediction() {
        let report = PredictionReport {
            succeeded: vec![PredictedSubject {
                ordinal: 0,
                subject: "p01".to_owned(),
                path: PathBuf::from("out/p01.nii.gz"),
            }],
            failed: vec![FailedSubject {
                subject: "p02".to_owned(),
                reason: "boom".to_owned(),
            }],
        };
        let mut buf = Vec::new();
        describe_prediction_into(&report, &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("Succeeded: 1"));
        assert!(text.contains("p01 -> out/p01.nii.gz"));
        assert!(text.ends_with("p02: boom"));
    }
}
