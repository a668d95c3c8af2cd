//! Typed convenience operations over a dispatcher.

use async_trait::async_trait;

use super::client::{SubmitOptions, TaskDispatcher};
use crate::error::TaskError;
use crate::table::TabularResult;
use crate::wire::{
    AggregatePayload, ColumnStatistics, ExportOutput, ExportPayload, FilterPayload,
    OperationOutput, OperationPayload, ParsePayload, Priority, SortPayload, StatisticsPayload,
    TransformPayload, ValidatePayload, ValidationReport,
};

/// What callers outside the pool see: one typed call per operation.
#[async_trait]
pub trait TabularOperations: Send + Sync {
    /// Run any payload with explicit priority and options.
    async fn run(
        &self,
        payload: OperationPayload,
        priority: Priority,
        options: SubmitOptions,
    ) -> Result<OperationOutput, TaskError>;

    async fn parse(&self, payload: ParsePayload) -> Result<TabularResult, TaskError> {
        let out = self
            .run(
                OperationPayload::Parse(payload),
                Priority::Normal,
                SubmitOptions::default(),
            )
            .await?;
        table(out)
    }

    async fn filter(&self, payload: FilterPayload) -> Result<TabularResult, TaskError> {
        let out = self
            .run(
                OperationPayload::Filter(payload),
                Priority::Normal,
                SubmitOptions::default(),
            )
            .await?;
        table(out)
    }

    async fn sort(&self, payload: SortPayload) -> Result<TabularResult, TaskError> {
        let out = self
            .run(
                OperationPayload::Sort(payload),
                Priority::Normal,
                SubmitOptions::default(),
            )
            .await?;
        table(out)
    }

    async fn export_csv(&self, payload: ExportPayload) -> Result<ExportOutput, TaskError> {
        let out = self
            .run(
                OperationPayload::ExportCsv(payload),
                Priority::Normal,
                SubmitOptions::default(),
            )
            .await?;
        export(out)
    }

    async fn export_json(&self, payload: ExportPayload) -> Result<ExportOutput, TaskError> {
        let out = self
            .run(
                OperationPayload::ExportJson(payload),
                Priority::Normal,
                SubmitOptions::default(),
            )
            .await?;
        export(out)
    }

    async fn export_tabular(&self, payload: ExportPayload) -> Result<ExportOutput, TaskError> {
        let out = self
            .run(
                OperationPayload::ExportTabular(payload),
                Priority::Normal,
                SubmitOptions::default(),
            )
            .await?;
        export(out)
    }

    async fn aggregate(&self, payload: AggregatePayload) -> Result<TabularResult, TaskError> {
        let out = self
            .run(
                OperationPayload::Aggregate(payload),
                Priority::Normal,
                SubmitOptions::default(),
            )
            .await?;
        table(out)
    }

    async fn statistics(
        &self,
        payload: StatisticsPayload,
    ) -> Result<Vec<ColumnStatistics>, TaskError> {
        let out = self
            .run(
                OperationPayload::Statistics(payload),
                Priority::Normal,
                SubmitOptions::default(),
            )
            .await?;
        let kind = out.kind();
        out.into_statistics()
            .ok_or_else(|| TaskError::UnexpectedOutput(kind.to_string()))
    }

    async fn validate(&self, payload: ValidatePayload) -> Result<ValidationReport, TaskError> {
        let out = self
            .run(
                OperationPayload::Validate(payload),
                Priority::Normal,
                SubmitOptions::default(),
            )
            .await?;
        let kind = out.kind();
        out.into_validation()
            .ok_or_else(|| TaskError::UnexpectedOutput(kind.to_string()))
    }

    async fn transform(&self, payload: TransformPayload) -> Result<TabularResult, TaskError> {
        let out = self
            .run(
                OperationPayload::Transform(payload),
                Priority::Normal,
                SubmitOptions::default(),
            )
            .await?;
        table(out)
    }
}

fn table(out: OperationOutput) -> Result<TabularResult, TaskError> {
    let kind = out.kind();
    out.into_table()
        .ok_or_else(|| TaskError::UnexpectedOutput(kind.to_string()))
}

fn export(out: OperationOutput) -> Result<ExportOutput, TaskError> {
    let kind = out.kind();
    out.into_export()
        .ok_or_else(|| TaskError::UnexpectedOutput(kind.to_string()))
}

#[async_trait]
impl TabularOperations for TaskDispatcher {
    async fn run(
        &self,
        payload: OperationPayload,
        priority: Priority,
        options: SubmitOptions,
    ) -> Result<OperationOutput, TaskError> {
        self.submit(payload, priority, options).await
    }
}
