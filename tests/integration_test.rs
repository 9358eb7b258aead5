use nalgebra::DMatrix;
use std::sync::atomic::Ordering;
use towerrec::algorithms::loss::in_batch_softmax;
use towerrec::algorithms::{DenseLayer, OptimizerKind, Tower};
use towerrec::data::synthetic::{self, SyntheticConfig};
use towerrec::*;

fn rows_changed(before: &DMatrix<f32>, after: &DMatrix<f32>) -> Vec<usize> {
    (0..before.nrows())
        .filter(|&r| before.row(r) != after.row(r))
        .collect()
}

#[test]
fn test_single_step_touches_only_batch_rows() {
    let mut model = TwoTowerModel::new(4, 5, ModelConfig::shallow(2).with_seed(1)).unwrap();
    let users_before = model.user_embeddings().weights().clone();
    let items_before = model.item_embeddings().weights().clone();

    let loss = model.train_step(&[0, 1], &[0, 1], BatchFeatures::default()).unwrap();
    assert!(loss.is_finite());
    assert!(loss > 0.0);

    assert_eq!(rows_changed(&users_before, model.user_embeddings().weights()), vec![0, 1]);
    assert_eq!(rows_changed(&items_before, model.item_embeddings().weights()), vec![0, 1]);
}

#[test]
fn test_lookup_matches_parameters_after_updates() {
    let mut model = TwoTowerModel::new(4, 5, ModelConfig::shallow(3).with_seed(2)).unwrap();
    for step in 0..3 {
        model
            .train_step(&[step, 3], &[4 - step, step], BatchFeatures::default())
            .unwrap();
        let looked_up = model.item_embeddings().lookup(&[0, 1, 2, 3, 4]).unwrap();
        assert_eq!(&looked_up, model.item_embeddings().weights());
        assert_eq!(
            model.user_embeddings().row(3).unwrap(),
            model.user_embeddings().weights().row(3).iter().copied().collect::<Vec<_>>()
        );
    }
}

#[test]
fn test_batch_of_one_trains() {
    let mut model = TwoTowerModel::new(4, 5, ModelConfig::shallow(2).with_seed(3)).unwrap();
    let loss = model.train_step(&[2], &[4], BatchFeatures::default()).unwrap();
    assert!(loss.is_finite());
    assert_eq!(model.version(), 1);
}

#[test]
fn test_empty_batch_rejected() {
    let mut model = TwoTowerModel::new(4, 5, ModelConfig::shallow(2)).unwrap();
    assert_eq!(
        model.train_step(&[], &[], BatchFeatures::default()).unwrap_err(),
        ModelError::EmptyBatch
    );
}

#[test]
fn test_score_before_index_is_stale() {
    let model = TwoTowerModel::new(4, 5, ModelConfig::shallow(2)).unwrap();
    assert_eq!(
        model.score_user(0, None).unwrap_err(),
        ModelError::StaleIndex {
            built_for: None,
            current: 0
        }
    );
}

#[test]
fn test_scores_cover_catalog_and_are_deterministic() {
    let config = ModelConfig::deep(4, vec![8, 4], 3).with_seed(5);
    let mut model = TwoTowerModel::new(6, 7, config).unwrap();
    let features = DMatrix::from_fn(7, 3, |r, c| if r % 3 == c { 1.0 } else { 0.0 });
    model
        .train_step(
            &[0, 1, 2],
            &[0, 3, 6],
            BatchFeatures::items(&DMatrix::from_fn(3, 3, |r, c| features[([0, 3, 6][r], c)])),
        )
        .unwrap();
    model.build_index(Some(&features)).unwrap();

    let first = model.score_user(1, None).unwrap();
    assert_eq!(first.scores.len(), 7);
    assert!(first.scores.iter().all(|s| s.is_finite()));
    for _ in 0..3 {
        let again = model.score_user(1, None).unwrap();
        assert_eq!(again.scores, first.scores);
        assert_eq!(again.ranked, first.ranked);
    }
    assert!(first
        .ranked
        .windows(2)
        .all(|w| first.scores[w[0]] >= first.scores[w[1]]));
}

#[test]
fn test_out_of_range_user() {
    let mut model = TwoTowerModel::new(4, 5, ModelConfig::shallow(2)).unwrap();
    model.build_index(None).unwrap();
    assert!(matches!(
        model.score_user(4, None),
        Err(ModelError::IndexOutOfRange {
            entity: Entity::User,
            index: 4,
            count: 4
        })
    ));
}

#[test]
fn test_shallow_tower_is_identity() {
    let model = TwoTowerModel::new(3, 4, ModelConfig::shallow(5).with_seed(8)).unwrap();
    let raw = model.user_embeddings().lookup(&[2, 0]).unwrap();
    assert_eq!(model.encode_users(&[2, 0], None).unwrap(), raw);
}

#[test]
fn test_identity_layers_give_relu_closed_form() {
    let identity = DMatrix::<f32>::identity(2, 2);
    let tower = Tower::from_layers(
        2,
        0,
        vec![
            DenseLayer::new(identity.clone(), vec![0.0, 0.0]).unwrap(),
            DenseLayer::new(identity, vec![0.0, 0.0]).unwrap(),
        ],
    )
    .unwrap();

    // ReLU after the first layer only
    let input = DMatrix::from_row_slice(2, 2, &[1.5, -2.0, -0.5, 3.0]);
    let output = tower.forward(&input, None).unwrap();
    assert_eq!(output, DMatrix::from_row_slice(2, 2, &[1.5, 0.0, 0.0, 3.0]));
}

#[test]
fn test_mismatched_tower_outputs_rejected() {
    let mut config = ModelConfig::deep(4, vec![8, 4], 0);
    config.user_hidden = vec![8, 6];
    assert_eq!(
        TwoTowerModel::new(2, 2, config).unwrap_err(),
        ModelError::TowerDimensionMismatch { user: 6, item: 4 }
    );
}

#[test]
fn test_user_features_flow_through_user_tower() {
    let config = ModelConfig::deep(4, vec![8, 4], 0).with_user_features(2).with_seed(3);
    let mut model = TwoTowerModel::new(3, 5, config).unwrap();

    let layers = model.user_tower().layers();
    assert_eq!(model.user_tower().feature_dim(), 2);
    assert_eq!(layers[0].weight().shape(), (6, 8));
    assert_eq!(layers[1].bias().shape(), (1, 4));
    let first_weight = layers[0].weight().clone();
    let last_bias = layers[1].bias().clone();

    let user_features = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, 1.0]);
    let loss = model
        .train_step(
            &[0, 1],
            &[2, 3],
            BatchFeatures {
                users: Some(&user_features),
                items: None,
            },
        )
        .unwrap();
    assert!(loss.is_finite());
    assert_ne!(model.user_tower().layers()[0].weight(), &first_weight);
    assert_ne!(model.user_tower().layers()[1].bias(), &last_bias);

    model.build_index(None).unwrap();
    let with_features = model.score_user(0, Some(&[1.0, 0.0])).unwrap();
    let without_features = model.score_user(0, None).unwrap();
    assert_eq!(with_features.len(), 5);
    assert!(with_features.scores.iter().all(|s| s.is_finite()));
    assert!(without_features.scores.iter().all(|s| s.is_finite()));
    assert_ne!(with_features.scores, without_features.scores);

    // scores are dot products of the encoded user with the indexed items
    let query = model
        .encode_users(&[0], Some(&DMatrix::from_row_slice(1, 2, &[1.0, 0.0])))
        .unwrap();
    let expected = model.item_vectors().unwrap() * query.transpose();
    for (i, score) in with_features.scores.iter().enumerate() {
        assert!((score - expected[(i, 0)]).abs() < 1e-5);
    }

    assert!(matches!(
        model.score_user(0, Some(&[1.0])),
        Err(ModelError::ShapeMismatch(_))
    ));
}

#[test]
fn test_l2_penalty_adds_to_loss() {
    let plain_config = ModelConfig::shallow(3).with_seed(6);
    let mut plain = TwoTowerModel::new(4, 5, plain_config.clone()).unwrap();
    let mut regularized = TwoTowerModel::new(4, 5, plain_config.with_l2(0.1)).unwrap();

    let users = [0, 2, 3];
    let items = [1, 4, 0];
    let user_rows = plain.user_embeddings().lookup(&users).unwrap();
    let item_rows = plain.item_embeddings().lookup(&items).unwrap();
    let penalty = 0.1 * (user_rows.norm_squared() + item_rows.norm_squared());

    let plain_loss = plain.train_step(&users, &items, BatchFeatures::default()).unwrap();
    let regularized_loss = regularized
        .train_step(&users, &items, BatchFeatures::default())
        .unwrap();
    assert!(regularized_loss > plain_loss);
    assert!((regularized_loss - plain_loss - penalty).abs() < 1e-5);
}

#[test]
fn test_sgd_model_steps_along_negative_gradient() {
    let config = ModelConfig::shallow(2)
        .with_seed(4)
        .with_optimizer(OptimizerKind::Sgd)
        .with_learning_rate(0.5);
    let mut model = TwoTowerModel::new(4, 5, config).unwrap();

    let users_before = model.user_embeddings().weights().clone();
    let items_before = model.item_embeddings().weights().clone();
    let expected = in_batch_softmax(
        &model.user_embeddings().lookup(&[0, 1]).unwrap(),
        &model.item_embeddings().lookup(&[2, 3]).unwrap(),
        0.0,
    )
    .unwrap();

    let loss = model.train_step(&[0, 1], &[2, 3], BatchFeatures::default()).unwrap();
    assert!((loss - expected.loss).abs() < 1e-6);

    for (k, &user) in [0usize, 1].iter().enumerate() {
        for c in 0..2 {
            let stepped = users_before[(user, c)] - 0.5 * expected.grad_users[(k, c)];
            assert!((model.user_embeddings().weights()[(user, c)] - stepped).abs() < 1e-6);
        }
    }
    for (k, &item) in [2usize, 3].iter().enumerate() {
        for c in 0..2 {
            let stepped = items_before[(item, c)] - 0.5 * expected.grad_items[(k, c)];
            assert!((model.item_embeddings().weights()[(item, c)] - stepped).abs() < 1e-6);
        }
    }
    assert_eq!(rows_changed(&users_before, model.user_embeddings().weights()), vec![0, 1]);
    assert_eq!(rows_changed(&items_before, model.item_embeddings().weights()), vec![2, 3]);
}

#[test]
fn test_deep_index_needs_item_features() {
    let mut model = TwoTowerModel::new(3, 4, ModelConfig::deep(4, vec![8, 4], 3).with_seed(2)).unwrap();
    assert!(matches!(model.build_index(None), Err(ModelError::ShapeMismatch(_))));
    assert!(matches!(
        model.score_user(0, None),
        Err(ModelError::StaleIndex { built_for: None, .. })
    ));
}

fn small_dataset() -> Dataset {
    let (items, ratings) = synthetic::generate(&SyntheticConfig {
        num_users: 24,
        num_items: 40,
        num_genres: 4,
        interactions_per_user: 10,
        affinity: 0.9,
        seed: 21,
    });
    Dataset::from_raw(items, &ratings).unwrap()
}

fn training() -> TrainingConfig {
    TrainingConfig {
        epochs: 3,
        batch_size: 32,
        min_user_interactions: 5,
        shuffle_seed: Some(9),
        log_every: 0,
    }
}

#[test]
fn test_fit_recommend_evaluate() {
    let full = small_dataset();
    let (train, held_out) = full.leave_last_out(5);
    assert_eq!(held_out.len(), 24);

    let mut models = vec![
        TwoTowerModel::new(
            train.num_users(),
            train.num_items(),
            ModelConfig::shallow(8).with_seed(1).with_learning_rate(0.01),
        )
        .unwrap(),
        TwoTowerModel::new(
            train.num_users(),
            train.num_items(),
            ModelConfig::deep(8, vec![16, 8], train.feature_dim())
                .with_seed(2)
                .with_learning_rate(0.01),
        )
        .unwrap(),
    ];

    let reports = TrainingService::new(training()).fit_all(&mut models, &train).unwrap();
    assert_eq!(reports.len(), 2);
    for report in &reports {
        // 216 pairs in batches of 32
        assert_eq!(report.steps, 3 * 7);
        assert_eq!(report.epochs_completed, 3);
        assert!(report.final_loss().is_some_and(f32::is_finite));
    }

    let recommender = RecommendationService::new(RecommendationConfig::default());
    for model in &models {
        let response = recommender.recommend(model, &train, 0, 5).unwrap();
        let seen = train.seen_items(0);
        assert_eq!(response.recommendations.len(), 5);
        assert!(response.recommendations.iter().all(|r| !seen.contains(&r.item)));

        let metrics = recommender.evaluate(model, &train, &held_out, 10).unwrap();
        assert_eq!(metrics.users_evaluated, 24);
        assert!((0.0..=1.0).contains(&metrics.hit_rate_at_k));
        assert!((0.0..=1.0).contains(&metrics.ndcg_at_k));

        let projection = model.project_items(50).unwrap();
        assert_eq!(projection.points.shape(), (40, 2));
    }
}

#[test]
fn test_cancel_flag_stops_training() {
    let dataset = small_dataset();
    let mut model = TwoTowerModel::new(dataset.num_users(), dataset.num_items(), ModelConfig::shallow(4)).unwrap();
    let service = TrainingService::new(training());
    service.cancel_flag().store(true, Ordering::SeqCst);

    let report = service.fit(&mut model, &dataset).unwrap();
    assert!(report.cancelled);
    assert_eq!(report.steps, 0);
    assert!(model.score_user(0, None).is_ok());
}

#[test]
fn test_report_serializes() {
    let dataset = small_dataset();
    let mut model = TwoTowerModel::new(dataset.num_users(), dataset.num_items(), ModelConfig::shallow(4)).unwrap();
    let report = TrainingService::new(TrainingConfig {
        epochs: 1,
        ..training()
    })
    .fit(&mut model, &dataset)
    .unwrap();

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["steps"], serde_json::json!(report.steps));
    assert_eq!(json["run_id"], serde_json::json!(model.run_id().to_string()));
}
