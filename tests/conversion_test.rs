//! End-to-end conversion tests: procedure text in, model text out.

use std::collections::BTreeMap;

use pretty_assertions::assert_eq;
use procshift::prelude::*;
use procshift::rewriter::MANUAL_MARKER;

const SALES_REPORT: &str = r#"
CREATE PROCEDURE dbo.usp_sales_report
    @start_date DATE,
    @end_date DATE,
    @region VARCHAR(50) = NULL
AS
BEGIN
    SET NOCOUNT ON;

    SELECT o.customer_id,
           o.order_date,
           SUM(o.amount) AS total_amount,
           GETDATE() AS loaded_at
    FROM dbo.orders o WITH (NOLOCK)
    WHERE o.order_date BETWEEN @start_date AND @end_date
      AND (@region IS NULL OR o.region = @region)
    GROUP BY o.customer_id, o.order_date;
END
GO
"#;

const CUSTOMER_SYNC: &str = r#"
CREATE PROCEDURE dbo.usp_customer_sync @load_date DATE AS
BEGIN
    DELETE FROM dbo.customer_dim WHERE load_date = @load_date;

    INSERT INTO dbo.customer_dim (customer_id, email, load_date)
    SELECT c.customer_id, c.email, @load_date
    FROM staging.customers c;
END
"#;

const INVENTORY_SNAPSHOT: &str = r#"
CREATE PROCEDURE dbo.usp_inventory_snapshot AS
BEGIN
    SELECT sku, warehouse_id, qty INTO #stock FROM dbo.inventory WHERE qty > 0;

    INSERT INTO dbo.inventory_history (sku, warehouse_id, qty, snapshot_at)
    SELECT sku, warehouse_id, qty, GETDATE() FROM #stock;

    DROP TABLE #stock;
END
"#;

const REBUILD_LOOP: &str = r#"
CREATE PROCEDURE dbo.usp_rebuild_items @batch INT = 10 AS
BEGIN
    DECLARE @i INT = 0;
    WHILE @i < @batch
    BEGIN
        EXEC dbo.usp_rebuild_step @i;
        SET @i = @i + 1;
    END
    SELECT id FROM dbo.items;
END
"#;

const SALES_FACT_LOAD: &str = r#"
CREATE PROCEDURE dbo.usp_sales_fact AS
BEGIN
    INSERT INTO dbo.sales_fact (order_id, amount)
    SELECT order_id, amount FROM dbo.orders;

    UPDATE dbo.etl_control SET last_run = GETDATE() WHERE job_name = 'sales';
END
"#;

fn date_range() -> ConvertOptions {
    ConvertOptions::new()
        .with_date_range("2024-01-01", "2024-01-31")
        .unwrap()
}

fn rule(artifact: &ConversionArtifact, id: &str) -> (bool, bool) {
    let entry = artifact
        .rules
        .iter()
        .find(|e| e.rule == id)
        .unwrap_or_else(|| panic!("no log entry for {id}"));
    (entry.relevant, entry.applied)
}

#[test]
fn test_full_load_on_redshift() {
    let artifact = procshift::convert(SALES_REPORT, "sales_report", "redshift", &date_range()).unwrap();

    assert_eq!(artifact.pattern, ConversionPattern::FullLoad);
    assert_eq!(artifact.platform, Platform::Redshift);
    assert_eq!(artifact.procedure_name.as_deref(), Some("dbo.usp_sales_report"));
    assert_eq!(artifact.score, 100);
    assert_eq!(artifact.breakdown.markers, 0);

    let text = &artifact.text;
    assert!(text.starts_with("-- sales_report: converted from dbo.usp_sales_report\n"));
    assert!(text.contains("materialized='table'"));
    assert!(text.contains("sort=['order_date']"));
    assert!(text.contains("dist='customer_id'"));
    assert!(text.contains("tags=['sales']"));
    assert!(text.contains("FROM {{ ref('orders') }} o"));
    assert!(text.contains("BETWEEN {{ var('start_date') }} AND {{ var('end_date') }}"));
    assert!(text.contains(
        "{% if var('region', none) is not none %}AND o.region = {{ var('region', none) }}{% endif %}"
    ));
    assert!(text.contains("sysdate AS loaded_at"));
    for leftover in ["NOLOCK", "NOCOUNT", "GETDATE", "@", "GO\n"] {
        assert!(!text.contains(leftover), "{leftover} left in model");
    }

    assert_eq!(rule(&artifact, "optional-params"), (true, true));
    assert_eq!(rule(&artifact, "required-params"), (true, true));
    assert_eq!(rule(&artifact, "date-functions"), (true, true));
    assert_eq!(rule(&artifact, "table-refs"), (true, true));
    assert_eq!(rule(&artifact, "temp-tables"), (false, false));
    assert_eq!(artifact.refs, vec!["orders".to_string()]);
}

#[test]
fn test_multiple_dml_becomes_incremental_merge() {
    let options = ConvertOptions::new().with_var("load_date", "2024-03-01");
    let artifact = procshift::convert(CUSTOMER_SYNC, "customer_sync", "glue", &options).unwrap();

    assert_eq!(artifact.pattern, ConversionPattern::MultiDmlUpsert);
    assert_eq!(artifact.target_table.as_deref(), Some("customer_dim"));
    assert_eq!(artifact.config.unique_key, vec!["load_date".to_string()]);
    assert_eq!(artifact.score, 100);

    let text = &artifact.text;
    assert!(text.contains("materialized='incremental'"));
    assert!(text.contains("incremental_strategy='merge'"));
    assert!(text.contains("unique_key='load_date'"));
    assert!(text.contains("file_format='iceberg'"));
    assert!(text.contains("SELECT c.customer_id, c.email, {{ var('load_date') }}"));
    assert!(text.contains("FROM {{ source('staging', 'customers') }} c"));
    assert!(!text.contains("DELETE"));
    assert!(!text.contains("INSERT"));

    assert_eq!(
        artifact.sources,
        vec![procshift::engine::SourceTable {
            schema: "staging".into(),
            name: "customers".into(),
        }]
    );
}

#[test]
fn test_snapshot_with_temp_table_on_athena() {
    let artifact =
        procshift::convert(INVENTORY_SNAPSHOT, "inventory_snapshot", "athena", &ConvertOptions::new())
            .unwrap();

    assert_eq!(artifact.pattern, ConversionPattern::SnapshotAppend);
    assert_eq!(artifact.ctes, vec!["stock".to_string()]);
    assert_eq!(artifact.score, 100);

    let text = &artifact.text;
    assert!(text.contains("incremental_strategy='append'"));
    assert!(text.contains("table_type='hive'"));
    assert!(text.contains("WITH stock AS ("));
    assert!(text.contains("FROM {{ ref('inventory') }} WHERE qty > 0"));
    assert!(text.contains("qty, current_timestamp AS snapshot_at FROM stock"));
    assert!(!text.contains('#'));
    assert!(!text.contains("DROP"));
}

#[test]
fn test_procedural_code_is_marked_and_penalized() {
    let artifact =
        procshift::convert(REBUILD_LOOP, "rebuild_items", "glue", &ConvertOptions::new()).unwrap();

    assert_eq!(rule(&artifact, "optional-params"), (true, false));
    assert!(artifact.breakdown.markers >= 4);
    assert!(artifact.score < 50);
    assert!(
        artifact
            .text
            .lines()
            .any(|l| l.trim_start().starts_with(MANUAL_MARKER) && l.contains("loop"))
    );
    assert!(artifact.text.contains("WHILE @i < {{ var('batch', 10) }}"));
}

#[test]
fn test_side_effect_write_is_kept_and_marked() {
    let artifact =
        procshift::convert(SALES_FACT_LOAD, "sales_fact", "athena", &ConvertOptions::new()).unwrap();

    assert_eq!(artifact.target_table.as_deref(), Some("sales_fact"));
    assert_eq!(rule(&artifact, "target-dml"), (true, false));
    assert!(artifact.breakdown.markers >= 1);
    assert!(artifact.score < 100);

    let lines: Vec<&str> = artifact.text.lines().map(str::trim_start).collect();
    let update = lines
        .iter()
        .position(|l| l.starts_with("UPDATE"))
        .expect("control-table update kept");
    assert!(lines[update - 1].starts_with(MANUAL_MARKER));
    assert!(lines[update - 1].contains("table write"));
    assert!(artifact.text.contains("SELECT order_id, amount FROM {{ ref('orders') }}"));
}

#[test]
fn test_platforms_do_not_leak_into_each_other() {
    let text = "SELECT order_id, DATEADD(day, -1, GETDATE()) AS cutoff_ts FROM dbo.orders";
    let convert = |platform: &str| {
        procshift::convert(text, "orders_cutoff", platform, &ConvertOptions::new())
            .unwrap()
            .text
    };

    let glue = convert("glue");
    let athena = convert("athena");
    let redshift = convert("redshift");

    assert!(glue.contains("timestampadd(day, -1, current_timestamp())"));
    assert!(athena.contains("date_add('day', -1, current_timestamp)"));
    assert!(redshift.contains("DATEADD(day, -1, sysdate)"));

    assert!(!glue.contains("sysdate") && !glue.contains("date_add("));
    assert!(!athena.contains("sysdate") && !athena.contains("timestampadd"));
    assert!(!redshift.contains("current_timestamp"));
    assert!(glue.contains("(Spark SQL)"));
    assert!(athena.contains("(Trino SQL)"));
    assert!(redshift.contains("(Redshift SQL)"));
}

#[test]
fn test_batch_failures_are_isolated() {
    let registry = ProfileRegistry::builtin();
    let converter = Converter::new(&registry);
    let units = vec![
        SourceUnit::parse(CUSTOMER_SYNC, "customer_sync").unwrap(),
        SourceUnit::parse(SALES_REPORT, "sales_report").unwrap(),
        SourceUnit::parse(INVENTORY_SNAPSHOT, "inventory_snapshot").unwrap(),
    ];

    let results = converter.convert_batch(&units, "athena", &ConvertOptions::new());
    assert_eq!(results.len(), 3);
    // Neither procedure gets its required parameters; the snapshot needs none.
    assert!(matches!(
        &results[0],
        Err(ConvertError::UnresolvedRequiredParameter { parameter, .. }) if parameter == "load_date"
    ));
    assert!(matches!(
        &results[1],
        Err(ConvertError::UnresolvedRequiredParameter { parameter, .. }) if parameter == "start_date"
    ));
    let snapshot = results[2].as_ref().unwrap();
    assert_eq!(snapshot.name, "inventory_snapshot");
}

#[test]
fn test_unknown_platform_is_rejected() {
    let err = procshift::convert(SALES_REPORT, "sales_report", "snowflake", &date_range()).unwrap_err();
    assert_eq!(
        err.to_string(),
        "Unknown platform: 'snowflake'. Expected: glue, athena, or redshift"
    );
}

#[test]
fn test_score_stays_in_bounds() {
    for (text, name, options) in [
        (SALES_REPORT, "sales_report", date_range()),
        (INVENTORY_SNAPSHOT, "inventory_snapshot", ConvertOptions::new()),
        (REBUILD_LOOP, "rebuild_items", ConvertOptions::new()),
    ] {
        for profile in ProfileRegistry::shared().iter() {
            let artifact = procshift::convert(text, name, profile.key(), &options).unwrap();
            assert!(artifact.score <= 100);
            assert_eq!(artifact.score, artifact.breakdown.score);
            assert!(artifact.breakdown.applied <= artifact.breakdown.relevant);
        }
    }
}

#[test]
fn test_parameters_flow_into_project_vars() {
    let text = "CREATE PROCEDURE dbo.usp_big_orders @start_date DATE, @threshold INT = 100 AS\n\
                SELECT order_id, amount FROM dbo.orders\n\
                WHERE order_date >= @start_date AND amount > @threshold;";
    let options = ConvertOptions::new().with_var("start_date", "2024-01-01");
    let artifact = procshift::convert(text, "big_orders", "glue", &options).unwrap();

    let expected: BTreeMap<String, String> = [
        ("start_date".to_string(), "2024-01-01".to_string()),
        ("threshold".to_string(), "100".to_string()),
    ]
    .into_iter()
    .collect();
    assert_eq!(artifact.vars, expected);
    assert!(artifact.text.contains(
        "{% if var('threshold', 100) is not none %}AND amount > {{ var('threshold', 100) }}{% endif %}"
    ));

    let files = scaffold(
        std::slice::from_ref(&artifact),
        Platform::Glue,
        &ProjectSettings::default(),
        &BTreeMap::new(),
    )
    .unwrap();
    let project = files
        .iter()
        .find(|f| f.path.ends_with("dbt_project.yml"))
        .unwrap();
    let yaml: serde_yaml::Value = serde_yaml::from_str(&project.contents).unwrap();
    assert_eq!(yaml["name"].as_str(), Some("mssql_conversion_glue"));
    assert_eq!(yaml["vars"]["threshold"].as_str(), Some("100"));
    assert_eq!(yaml["vars"]["start_date"].as_str(), Some("2024-01-01"));
}

#[test]
fn test_reconverting_output_is_stable() {
    let first = procshift::convert(SALES_REPORT, "sales_report", "athena", &date_range()).unwrap();
    let registry = ProfileRegistry::builtin();
    let unit = SourceUnit::new("sales_report", Vec::new(), first.text.clone());
    let second = Converter::new(&registry)
        .convert(&unit, "athena", &ConvertOptions::new())
        .unwrap();
    assert!(second.text.ends_with(&first.text));
    assert_eq!(second.breakdown.markers, 0);
}
