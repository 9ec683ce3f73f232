use dicom::core::Tag;
use dicom::dictionary_std::tags;
use dicom::object::{FileMetaTable, FileMetaTableBuilder, InMemDicomObject};
use std::fmt;

use crate::errors::DicomError;

/// CT Image Storage, used when neither the file meta nor the dataset names a SOP class.
pub const CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";

#[derive(Clone, Debug, PartialEq)]
pub struct RestoreFailure {
    pub field: &'static str,
    pub reason: String,
}

impl fmt::Display for RestoreFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.reason)
    }
}

/// Fields that could not be carried over verbatim when rebuilding a file meta group.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RestoreReport {
    pub failures: Vec<RestoreFailure>,
}

impl RestoreReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn record<S: Into<String>>(&mut self, field: &'static str, reason: S) {
        self.failures.push(RestoreFailure {
            field,
            reason: reason.into(),
        });
    }

    pub fn extend(&mut self, other: RestoreReport) {
        self.failures.extend(other.failures);
    }
}

fn clean(value: &str) -> Option<String> {
    let value = value.trim_end_matches(|c: char| c == '\0' || c.is_whitespace());
    (!value.is_empty()).then(|| value.to_string())
}

fn dataset_str(dataset: &InMemDicomObject, tag: Tag) -> Option<String> {
    let value = dataset.get(tag)?.value().to_str().ok()?;
    clean(&value)
}

/// File meta fields carried from a source file onto a rebuilt container.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetaFields {
    pub media_storage_sop_class_uid: Option<String>,
    pub media_storage_sop_instance_uid: Option<String>,
    pub transfer_syntax: Option<String>,
    pub implementation_class_uid: Option<String>,
    pub implementation_version_name: Option<String>,
    pub source_application_entity_title: Option<String>,
}

impl From<&FileMetaTable> for MetaFields {
    fn from(meta: &FileMetaTable) -> Self {
        Self {
            media_storage_sop_class_uid: clean(&meta.media_storage_sop_class_uid),
            media_storage_sop_instance_uid: clean(&meta.media_storage_sop_instance_uid),
            transfer_syntax: clean(&meta.transfer_syntax),
            implementation_class_uid: clean(&meta.implementation_class_uid),
            implementation_version_name: meta.implementation_version_name.as_deref().and_then(clean),
            source_application_entity_title: meta
                .source_application_entity_title
                .as_deref()
                .and_then(clean),
        }
    }
}

impl MetaFields {
    /// Build a file meta group for `dataset` written with `transfer_syntax`.
    ///
    /// SOP class and instance fall back to the dataset's own identifiers, and the SOP
    /// class finally to CT Image Storage. Every fallback is recorded in the report.
    pub fn restore(
        &self,
        dataset: &InMemDicomObject,
        transfer_syntax: &str,
    ) -> Result<(FileMetaTable, RestoreReport), DicomError> {
        let mut report = RestoreReport::default();

        let sop_class = match &self.media_storage_sop_class_uid {
            Some(uid) => uid.clone(),
            None => match dataset_str(dataset, tags::SOP_CLASS_UID) {
                Some(uid) => {
                    report.record(
                        "MediaStorageSOPClassUID",
                        "missing from file meta, taken from SOPClassUID",
                    );
                    uid
                }
                None => {
                    report.record(
                        "MediaStorageSOPClassUID",
                        format!("missing from file meta and dataset, defaulted to {CT_IMAGE_STORAGE}"),
                    );
                    CT_IMAGE_STORAGE.to_string()
                }
            },
        };

        let sop_instance = match &self.media_storage_sop_instance_uid {
            Some(uid) => uid.clone(),
            None => {
                let uid = dataset_str(dataset, tags::SOP_INSTANCE_UID).ok_or(
                    DicomError::MissingPropertyError {
                        name: "SOP Instance UID",
                    },
                )?;
                report.record(
                    "MediaStorageSOPInstanceUID",
                    "missing from file meta, taken from SOPInstanceUID",
                );
                uid
            }
        };

        let transfer_syntax = transfer_syntax.trim_end_matches('\0');
        match self.transfer_syntax.as_deref() {
            Some(original) if original == transfer_syntax => {}
            Some(original) => report.record(
                "TransferSyntaxUID",
                format!("replaced {original} with {transfer_syntax}"),
            ),
            None => report.record(
                "TransferSyntaxUID",
                format!("missing from file meta, set to {transfer_syntax}"),
            ),
        }

        let mut builder = FileMetaTableBuilder::new()
            .media_storage_sop_class_uid(sop_class)
            .media_storage_sop_instance_uid(sop_instance)
            .transfer_syntax(transfer_syntax);
        if let Some(uid) = &self.implementation_class_uid {
            builder = builder.implementation_class_uid(uid.clone());
        }
        if let Some(name) = &self.implementation_version_name {
            builder = builder.implementation_version_name(name.clone());
        }
        if let Some(title) = &self.source_application_entity_title {
            builder = builder.source_application_entity_title(title.clone());
        }

        let meta = builder.build().map_err(|e| DicomError::MetaError {
            message: e.to_string(),
        })?;
        Ok((meta, report))
    }
}
