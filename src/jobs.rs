//! Production job catalog: queries, rename maps, timestamp columns and
//! load modes for each destination table.

use chrono::{Duration, Local, NaiveDate};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::path::PathBuf;

use crate::config::Config;
use crate::enrich::{self, EnrichSpec};
use crate::job::{Job, Output};
use crate::model::{LoadMode, NullPolicy};
use crate::normalize::NormalizeSpec;

/// Flattened source name → destination column, in destination order.
type RenameMap = &'static [(&'static str, &'static str)];

const TICKET_RENAMES: RenameMap = &[
    ("Id", "id_service_appointment"),
    ("WorkOrder__r_Asset_SiglaCTO__c", "sigla_cto"),
    ("WorkOrder__r_Asset_CaixaCTO__c", "caixa_cto"),
    ("WorkOrder__r_Asset_PortaCTO__c", "porta_cto"),
    ("WorkOrder__r_dt_abertura__c", "dt_abertura"),
    ("WorkOrder__r_LegacyId__c", "codigo_cliente"),
    ("WorkOrder__r_WorkOrderNumber", "numero_ordem_trabalho"),
    ("WorkOrder__r_Case_CaseNumber", "caso"),
    ("AppointmentNumber", "numero_compromisso"),
    ("FirstScheduleDateTime__c", "data_primeiro_agendamento"),
    ("WorkOrder__r_DataAgendamento__c", "data_agendamento"),
    ("ArrivalWindowStart_Gantt__c", "inicio_janela_chegada"),
    ("ArrivalWindowEnd_Gantt__c", "termino_janela_chegada"),
    ("ScheduledStart_Gantt__c", "inicio_agendado"),
    ("SchedEndTime_Gantt__c", "termino_agendado"),
    ("ActualStart_Gantt__c", "inicio_servico"),
    ("ActualEnd_Gantt__c", "termino_servico"),
    ("TechnicianName__c", "nome_tecnico"),
    ("TechniciansCompany__c", "empresa_tecnico"),
    ("WorkOrder__r_City", "cidade"),
    ("WorkOrder__r_Work_Type_WO__c", "tipo_trabalho"),
    ("WorkOrder__r_Work_Subtype_WO__c", "subtipo_trabalho"),
    ("WorkOrder__r_Status", "status"),
    ("WorkOrder__r_CaseReason__c", "motivo_caso"),
    ("WorkOrder__r_Submotivo__c", "submotivo_caso"),
    ("LowCodeFormula__c", "codigo_baixa"),
    ("WorkOrder__r_ReasonForCancellationWorkOrder__c", "motivo_cancelamento"),
    ("Reschedule_Reason_SA__c", "motivo_reagendamento"),
    ("WorkOrder__r_SuspensionReasonWo__c", "motivo_suspensao"),
    ("WorkOrder__r_OLT__r_Name", "olt"),
    ("WorkOrder__r_CTO__c", "cto"),
    ("WorkOrder__r_Asset_Name", "ativo"),
    ("WorkOrder__r_LastModifiedDate", "last_modified_date"),
    ("WorkOrder__r_Case_Account_LXD_CPF__c", "cpf_cnpj"),
    ("FSL__Pinned__c", "pinned"),
    ("WorkOrder__r_IsRescheduledWo__c", "foi_reagendado"),
    ("WorkOrder__r_ConvenienciaCliente__c", "conveniencia_cliente"),
    ("WorkOrder__r_SolicitaAntecipacao__c", "solicita_antecipacao"),
    ("WorkOrder__r_HowManyTimesWo__c", "quantas_vezes"),
    ("WorkOrder__r_Subject", "subject"),
    ("StringPPoeUser__c", "pppoe"),
];

const TICKET_TIMESTAMPS: &[&str] = &[
    "WorkOrder__r_dt_abertura__c",
    "WorkOrder__r_DataAgendamento__c",
    "ArrivalWindowStart_Gantt__c",
    "ArrivalWindowEnd_Gantt__c",
    "ScheduledStart_Gantt__c",
    "SchedEndTime_Gantt__c",
    "ActualStart_Gantt__c",
    "ActualEnd_Gantt__c",
    "WorkOrder__r_LastModifiedDate",
];

const HISTORY_RENAMES: RenameMap = &[
    ("Id", "id"),
    ("ServiceAppointmentId", "appointment_id"),
    ("ServiceAppointment_AppointmentNumber", "appointment_number"),
    ("CreatedDate", "created_date"),
    ("Field", "field_name"),
    ("OldValue", "old_value"),
    ("NewValue", "new_value"),
    ("CreatedById", "created_by_id"),
    ("CreatedBy_Name", "created_by_name"),
];

/// Operator-facing labels for the tracked history fields.
static FIELD_LABELS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("MotivoDoCancelamento__c", "Motivo do Cancelamento"),
        ("SuspensionReason__c", "Motivo da Suspensão"),
        ("Reschedule_Reason_SA__c", "Motivo de REAGENDAMENTO"),
        ("RescheduleReasonSAHistory__c", "Motivo de REAGENDAMENTO"),
        ("TechnicianName__c", "Nome do Técnico"),
        ("SchedStartTime", "Início Agendado"),
    ])
});

const HISTORY_DDL_TEMPLATE: &str = "CREATE TABLE IF NOT EXISTS `{table}` (
    id VARCHAR(18) PRIMARY KEY,
    appointment_id VARCHAR(18),
    appointment_number VARCHAR(50),
    created_date DATETIME,
    field_name VARCHAR(255),
    old_value TEXT,
    new_value TEXT,
    created_by_id VARCHAR(18),
    created_by_name VARCHAR(255),
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
)";

const WO_HISTORY_RENAMES: RenameMap = &[
    ("Id", "id"),
    ("WorkOrder_WorkOrderNumber", "numero_ordem_trabalho"),
    ("Field", "campo"),
    ("CreatedBy_Name", "criado_por"),
    ("CreatedDate", "data_criacao"),
    ("OldValue", "valor_anterior"),
    ("NewValue", "valor_novo"),
];

/// Display headers for the hourly report, exactly as its consumers expect
/// them in the spreadsheet.
const HXH_RENAMES: RenameMap = &[
    (
        "ServiceAppointment_AppointmentNumber",
        "Compromisso de serviço: Número de compromisso",
    ),
    ("CreatedDate", "Created Date"),
    ("Field", "Campo alterado"),
    ("NewValue", "Valor da nova string"),
];

pub const TICKETS: &str = "tickets";
pub const APPOINTMENT_HISTORY: &str = "appointment_history";
pub const WORK_ORDER_HISTORY: &str = "work_order_history";
pub const HXH_REPORT: &str = "hxh_report";

/// Names of every registered job, in run order.
pub fn catalog() -> Vec<&'static str> {
    vec![TICKETS, APPOINTMENT_HISTORY, WORK_ORDER_HISTORY, HXH_REPORT]
}

/// Materialize the named job into one or more runnable units. The
/// appointment-history job re-extracts a day window per unit (D-n through
/// D0) so an interrupted run catches up naturally via its upsert key.
pub fn build(name: &str, cfg: &Config) -> Option<Vec<Job>> {
    match name {
        TICKETS => Some(vec![tickets(cfg)]),
        APPOINTMENT_HISTORY => Some(appointment_history(cfg, Local::now().date_naive())),
        WORK_ORDER_HISTORY => Some(vec![work_order_history(cfg)]),
        HXH_REPORT => Some(vec![hxh_report(cfg)]),
        _ => None,
    }
}

fn base_spec(renames: RenameMap, timestamps: &[&str], cfg: &Config) -> NormalizeSpec {
    NormalizeSpec {
        timestamp_cols: timestamps.iter().map(|c| c.to_string()).collect(),
        value_maps: HashMap::new(),
        rename: renames
            .iter()
            .map(|(from, to)| (from.to_string(), to.to_string()))
            .collect(),
        expected: renames.iter().map(|(_, to)| to.to_string()).collect(),
        utc_offset_hours: cfg.app.utc_offset_hours,
        null_policy: NullPolicy::DatabaseNull,
        keep_where: None,
    }
}

fn tickets(cfg: &Config) -> Job {
    let soql = format!(
        "SELECT \
            Id, \
            WorkOrder__r.Asset.SiglaCTO__c, \
            WorkOrder__r.Asset.CaixaCTO__c, \
            WorkOrder__r.Asset.PortaCTO__c, \
            WorkOrder__r.dt_abertura__c, \
            WorkOrder__r.LegacyId__c, \
            WorkOrder__r.WorkOrderNumber, \
            WorkOrder__r.Case.CaseNumber, \
            AppointmentNumber, \
            FirstScheduleDateTime__c, \
            WorkOrder__r.DataAgendamento__c, \
            ArrivalWindowStart_Gantt__c, \
            ArrivalWindowEnd_Gantt__c, \
            ScheduledStart_Gantt__c, \
            SchedEndTime_Gantt__c, \
            ActualStart_Gantt__c, \
            ActualEnd_Gantt__c, \
            TechnicianName__c, \
            TechniciansCompany__c, \
            WorkOrder__r.City, \
            WorkOrder__r.Work_Type_WO__c, \
            WorkOrder__r.Work_Subtype_WO__c, \
            WorkOrder__r.Status, \
            WorkOrder__r.CaseReason__c, \
            WorkOrder__r.Submotivo__c, \
            LowCodeFormula__c, \
            WorkOrder__r.ReasonForCancellationWorkOrder__c, \
            Reschedule_Reason_SA__c, \
            WorkOrder__r.SuspensionReasonWo__c, \
            WorkOrder__r.OLT__r.Name, \
            WorkOrder__r.CTO__c, \
            WorkOrder__r.Asset.Name, \
            WorkOrder__r.LastModifiedDate, \
            WorkOrder__r.Case.Account.LXD_CPF__c, \
            FSL__Pinned__c, \
            WorkOrder__r.IsRescheduledWo__c, \
            WorkOrder__r.ConvenienciaCliente__c, \
            WorkOrder__r.SolicitaAntecipacao__c, \
            WorkOrder__r.HowManyTimesWo__c, \
            WorkOrder__r.Subject, \
            StringPPoeUser__c \
        FROM ServiceAppointment \
        WHERE SchedEndTime_Gantt__c >= {} \
          AND WorkOrder__r.Subject LIKE '%INC%' \
          AND Status = 'Concluída' \
          AND WorkOrder__r.Work_Type_WO__c = 'Manutenção'",
        cfg.jobs.tickets.sched_end_from
    );

    let mut spec = base_spec(TICKET_RENAMES, TICKET_TIMESTAMPS, cfg);
    // The enrichment columns are part of the destination schema and must
    // survive the conform step.
    spec.expected.extend([
        enrich::STATUS_COL.to_string(),
        enrich::START_COL.to_string(),
        enrich::STOP_COL.to_string(),
        enrich::ELAPSED_COL.to_string(),
    ]);

    Job {
        name: TICKETS.to_string(),
        soql,
        normalize: spec,
        enrich: Some(EnrichSpec::default()),
        output: Output::Warehouse {
            table: cfg.jobs.tickets.table.clone(),
            mode: LoadMode::Truncate,
            ensure_ddl: None,
        },
    }
}

fn appointment_history(cfg: &Config, today: NaiveDate) -> Vec<Job> {
    let days_back = cfg.jobs.appointment_history.days_back as i64;
    let offset = cfg.app.utc_offset_hours;
    let ddl = HISTORY_DDL_TEMPLATE.replace("{table}", &cfg.jobs.appointment_history.table);

    (0..=days_back)
        .rev()
        .map(|back| {
            let day = today - Duration::days(back);
            let next = day + Duration::days(1);
            let lit = |d: NaiveDate| format!("{}T00:00:00.000{:+03}:00", d.format("%Y-%m-%d"), offset);
            let soql = format!(
                "SELECT \
                    Id, ServiceAppointmentId, ServiceAppointment.AppointmentNumber, \
                    CreatedDate, Field, OldValue, NewValue, CreatedById, CreatedBy.Name \
                FROM ServiceAppointmentHistory \
                WHERE Field IN ('MotivoDoCancelamento__c', 'SuspensionReason__c', \
                    'Reschedule_Reason_SA__c', 'RescheduleReasonSAHistory__c', \
                    'TechnicianName__c', 'SchedStartTime') \
                  AND CreatedDate >= {} \
                  AND CreatedDate < {}",
                lit(day),
                lit(next)
            );

            let mut spec = base_spec(
                HISTORY_RENAMES,
                // Old/new values are mixed columns: datetimes for schedule
                // changes, plain labels for everything else. The probe in
                // the normalizer sorts them out per value.
                &["CreatedDate", "OldValue", "NewValue"],
                cfg,
            );
            spec.value_maps.insert(
                "Field".to_string(),
                FIELD_LABELS
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            );

            Job {
                name: format!("{APPOINTMENT_HISTORY} ({day})"),
                soql,
                normalize: spec,
                enrich: None,
                output: Output::Warehouse {
                    table: cfg.jobs.appointment_history.table.clone(),
                    mode: LoadMode::Upsert { key: "id" },
                    ensure_ddl: Some(ddl.clone()),
                },
            }
        })
        .collect()
}

fn work_order_history(cfg: &Config) -> Job {
    let soql = format!(
        "SELECT Id, WorkOrder.WorkOrderNumber, Field, CreatedBy.Name, \
            CreatedDate, OldValue, NewValue \
        FROM WorkOrderHistory \
        WHERE (Field = 'Priority' OR Field = 'Priority2__c') \
          AND CreatedDate >= {}",
        cfg.jobs.work_order_history.created_from
    );

    Job {
        name: WORK_ORDER_HISTORY.to_string(),
        soql,
        normalize: base_spec(WO_HISTORY_RENAMES, &["CreatedDate"], cfg),
        enrich: None,
        output: Output::Warehouse {
            table: cfg.jobs.work_order_history.table.clone(),
            mode: LoadMode::Truncate,
            ensure_ddl: None,
        },
    }
}

/// Spreadsheet export of the tracked appointment-history changes: four
/// display-named columns, empty strings instead of nulls, written to a CSV
/// file rather than the warehouse.
fn hxh_report(cfg: &Config) -> Job {
    let soql = format!(
        "SELECT Id, IsDeleted, ServiceAppointmentId, \
            ServiceAppointment.AppointmentNumber, CreatedById, CreatedDate, \
            Field, DataType, OldValue, NewValue, CreatedBy.Name \
        FROM ServiceAppointmentHistory \
        WHERE CreatedDate >= {} \
          AND Field IN ('MotivoDoCancelamento__c', 'SuspensionReason__c', \
            'Reschedule_Reason_SA__c', 'RescheduleReasonSAHistory__c')",
        cfg.jobs.hxh_report.created_from
    );

    let mut spec = base_spec(HXH_RENAMES, &[], cfg);
    spec.null_policy = NullPolicy::EmptyString;

    Job {
        name: HXH_REPORT.to_string(),
        soql,
        normalize: spec,
        enrich: None,
        output: Output::Csv {
            path: PathBuf::from(&cfg.jobs.hxh_report.path),
        },
    }
}
