//! 两条流水线在小尺寸合成数据上的端到端测试.

use brats_berry::config::Config;
use brats_berry::dataset::{fetch_training_files, read_id_list};
use brats_berry::pipeline::{run_prediction, run_training, PredictArgs};
use brats_berry::{Affine, Error, MriLabel, MriScan, NiftiHeaderAttr};
use ndarray::Array3;
use std::fs;
use std::path::{Path, PathBuf};

const SHAPE: [usize; 3] = [6, 6, 6];

fn init_logger() {
    let _ = simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Debug)
        .init();
}

/// 中心立方体为肿瘤的合成受试者.
fn subject(shape: [usize; 3], shift: usize) -> (Array3<f32>, Array3<u8>) {
    let [x, y, z] = shape;
    let inside = |i: usize, j: usize, k: usize| {
        (2..4).contains(&(i.saturating_sub(shift)))
            && (2..4).contains(&j)
            && (2..4).contains(&k)
    };
    let img = Array3::from_shape_fn((x, y, z), |(i, j, k)| {
        if inside(i, j, k) {
            100.0
        } else {
            10.0 + (i + j + k) as f32
        }
    });
    let label = Array3::from_shape_fn((x, y, z), |(i, j, k)| u8::from(inside(i, j, k)));
    (img, label)
}

fn write_training_tree(root: &Path, names: &[&str]) -> (PathBuf, PathBuf) {
    let img_root = root.join("data");
    let label_root = root.join("label");
    fs::create_dir_all(&img_root).unwrap();
    fs::create_dir_all(&label_root).unwrap();
    for (n, name) in names.iter().enumerate() {
        let (img, label) = subject(SHAPE, n % 2);
        let file = format!("{name}.nii.gz");
        MriScan::from_affine(img, &Affine::identity())
            .save(img_root.join(&file))
            .unwrap();
        MriLabel::from_affine(label, &Affine::identity())
            .save(label_root.join(&file))
            .unwrap();
    }
    (img_root, label_root)
}

fn training_config(root: &Path) -> Config {
    let (img_path, label_path) = write_training_tree(root, &["s1", "s2", "s3", "s4"]);
    Config {
        image_shape: SHAPE,
        n_epochs: 3,
        batch_size: 2,
        validation_batch_size: 2,
        validation_split: 0.5,
        training_patch_start_offset: None,
        permute: false,
        data_file: root.join("brats_data.npz"),
        model_file: root.join("unet_model.bin"),
        training_file: root.join("training_ids.bin"),
        validation_file: root.join("validation_ids.bin"),
        img_path,
        label_path,
        seed: Some(3),
        ..Config::default()
    }
}

#[test]
fn test_scenario_a_discovery() {
    let dir = tempfile::tempdir().unwrap();
    let (img, label) = write_training_tree(dir.path(), &["a", "b"]);
    let subjects = fetch_training_files(&img, &label, &[]).unwrap();
    assert_eq!(subjects.subject_ids(), vec!["a", "b"]);
    let groups: Vec<_> = subjects
        .file_groups()
        .into_iter()
        .map(|g| g.paths().to_vec())
        .collect();
    assert_eq!(
        groups,
        vec![
            vec![img.join("a.nii.gz"), label.join("a.nii.gz")],
            vec![img.join("b.nii.gz"), label.join("b.nii.gz")],
        ]
    );
}

#[test]
fn test_training_is_idempotent_and_reuses_split() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let config = training_config(dir.path());

    let first = run_training(&config).unwrap();
    assert_eq!(first.n_subjects, 4);
    assert!(first.dataset_built);
    // 每个生成器 2 个样本, 不超过批大小 2, 因此每个样本一步.
    assert_eq!(first.n_training_steps, 2);
    assert_eq!(first.n_validation_steps, 2);
    assert!(!first.history.epochs.is_empty());
    assert!(first.history.best_epoch.is_some());
    assert!(config.model_file.exists());
    assert!(dir.path().join("training.log").exists());

    let data_mtime = fs::metadata(&config.data_file).unwrap().modified().unwrap();
    let training_ids = fs::read(&config.training_file).unwrap();
    let validation_ids = fs::read(&config.validation_file).unwrap();
    assert_eq!(read_id_list(&config.training_file).unwrap().len(), 2);

    let second = run_training(&config).unwrap();
    assert!(!second.dataset_built);
    assert_eq!(
        fs::metadata(&config.data_file).unwrap().modified().unwrap(),
        data_mtime
    );
    assert_eq!(fs::read(&config.training_file).unwrap(), training_ids);
    assert_eq!(fs::read(&config.validation_file).unwrap(), validation_ids);
}

#[test]
fn test_missing_label_fails_fast() {
    let dir = tempfile::tempdir().unwrap();
    let config = training_config(dir.path());
    fs::remove_file(config.label_path.join("s3.nii.gz")).unwrap();
    assert!(matches!(run_training(&config), Err(Error::Discovery(_))));
    assert!(!config.data_file.exists());
}

#[test]
fn test_scenario_b_prediction_is_resampled_in_place() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let config = training_config(dir.path());
    run_training(&config).unwrap();

    // 待预测扫描的网格与打包形状不同.
    let validate_path = dir.path().join("test");
    fs::create_dir_all(&validate_path).unwrap();
    let reference_affine = Affine::from_zooms([0.75, 0.75, 0.75]);
    let (img, _) = subject([8, 8, 8], 0);
    MriScan::from_affine(img, &reference_affine)
        .save(validate_path.join("patient01.nii.gz"))
        .unwrap();

    let predict_config = Config {
        data_file: dir.path().join("test_data.npz"),
        validation_file: dir.path().join("test_validation_ids.bin"),
        ..config
    };
    let args = PredictArgs {
        validate_path,
        prediction_dir: dir.path().join("predictions"),
        output_basename: "{subject}.nii.gz".to_owned(),
        output_label_map: true,
    };
    let report = run_prediction(&predict_config, &args).unwrap();
    assert!(report.is_success(), "{:?}", report.failed);
    assert_eq!(report.succeeded.len(), 1);
    assert_eq!(report.succeeded[0].subject, "patient01");

    let expected = args.prediction_dir.join("patient01.nii.gz");
    assert_eq!(report.succeeded[0].path, expected);
    let prediction = MriLabel::open(&expected).unwrap();
    assert_eq!(prediction.shape(), [8, 8, 8]);
    assert_eq!(prediction.affine(), reference_affine);
    assert!(prediction.unique().iter().all(|v| *v <= 1));
    assert_eq!(
        read_id_list(&predict_config.validation_file).unwrap(),
        vec![0]
    );
}

#[test]
fn test_prediction_without_model_is_a_run_level_error() {
    let dir = tempfile::tempdir().unwrap();
    let validate_path = dir.path().join("test");
    fs::create_dir_all(&validate_path).unwrap();
    let (img, _) = subject(SHAPE, 0);
    MriScan::from_affine(img, &Affine::identity())
        .save(validate_path.join("p.nii.gz"))
        .unwrap();
    let config = Config {
        image_shape: SHAPE,
        data_file: dir.path().join("test_data.npz"),
        model_file: dir.path().join("missing.bin"),
        validation_file: dir.path().join("validation_ids.bin"),
        ..Config::default()
    };
    let args = PredictArgs {
        validate_path,
        prediction_dir: dir.path().join("out"),
        output_basename: "{subject}.nii.gz".to_owned(),
        output_label_map: true,
    };
    assert!(matches!(
        run_prediction(&config, &args),
        Err(Error::Predict(_))
    ));
    // 数据集与验证列表已经构建.
    assert!(config.data_file.exists());
    assert!(config.validation_file.exists());
}
