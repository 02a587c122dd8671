//! Fusión en memoria de etapas map-only consecutivas.
//!
//! Un [`FusedMapper`] corre N mappers uno detrás de otro dentro de una sola
//! tarea física. Entre etapa y etapa los registros pasan por el [`Relay`], un
//! buffer de un solo lugar, sin escribirse ni releerse de disco.

use tracing::debug;

use crate::conf::Configuration;
use crate::error::{ChainError, Result};
use crate::task::{Mapper, StageContext};
use crate::Record;

/// Buffer de un solo lugar + vista de configuración de la etapa actual.
///
/// Contadores, estado, progreso y salidas con nombre pasan directo a la
/// tarea real (`task`). En la última etapa (`terminal`) también la salida
/// principal va directo a la tarea, sin límite de emisiones.
pub struct Relay<'a, 't> {
    slot: Option<(Record, Record)>,
    emitted: usize,
    terminal: bool,
    view: &'a Configuration,
    task: &'t mut dyn StageContext,
}

impl<'a, 't> Relay<'a, 't> {
    pub fn new(view: &'a Configuration, task: &'t mut dyn StageContext) -> Self {
        Self {
            slot: None,
            emitted: 0,
            terminal: false,
            view,
            task,
        }
    }

    /// Guarda el par en el buffer, pisando lo que no se haya consumido.
    pub fn emit(&mut self, key: Record, value: Record) {
        self.slot = Some((key, value));
        self.emitted += 1;
    }

    /// Devuelve el contenido del buffer y lo vacía.
    /// `None` significa que la etapa anterior no emitió nada.
    pub fn consume(&mut self) -> Option<(Record, Record)> {
        self.emitted = 0;
        self.slot.take()
    }

    pub fn has_pending(&self) -> bool {
        self.slot.is_some()
    }

    /// Emisiones desde el último `consume`.
    pub fn emitted_since_consume(&self) -> usize {
        self.emitted
    }

    /// Cambia la vista de configuración a la de la próxima etapa.
    /// `terminal` indica que es la última etapa de la corrida fusionada.
    pub fn enter_stage(&mut self, view: &'a Configuration, terminal: bool) {
        self.view = view;
        self.terminal = terminal;
    }

    /// Entrega el par a la tarea real (salida de la última etapa).
    fn forward(&mut self, key: Record, value: Record) -> anyhow::Result<()> {
        self.task.write(key, value)
    }
}

impl StageContext for Relay<'_, '_> {
    fn configuration(&self) -> &Configuration {
        self.view
    }

    fn write(&mut self, key: Record, value: Record) -> anyhow::Result<()> {
        if self.terminal {
            return self.forward(key, value);
        }
        self.emit(key, value);
        Ok(())
    }

    fn write_named(&mut self, output: &str, key: Record, value: Record) -> anyhow::Result<()> {
        self.task.write_named(output, key, value)
    }

    fn increment_counter(&mut self, group: &str, name: &str, amount: u64) {
        self.task.increment_counter(group, name, amount);
    }

    fn set_status(&mut self, status: &str) {
        self.task.set_status(status);
    }

    fn progress(&mut self) {
        self.task.progress();
    }
}

/// Corrida de mappers fusionados con su vista de configuración precalculada.
pub struct FusedMapper {
    mappers: Vec<Box<dyn Mapper>>,
    views: Vec<Configuration>,
}

impl FusedMapper {
    /// `global` es la configuración del job físico, con las opciones de cada
    /// etapa sufijadas por su índice.
    pub fn new(mappers: Vec<Box<dyn Mapper>>, global: &Configuration) -> Self {
        let views = (0..mappers.len()).map(|n| global.stage_view(n)).collect();
        Self { mappers, views }
    }

    pub fn len(&self) -> usize {
        self.mappers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappers.is_empty()
    }

    pub fn view(&self, step: usize) -> Option<&Configuration> {
        self.views.get(step)
    }

    pub fn setup(&mut self, task: &mut dyn StageContext) -> Result<()> {
        let views = &self.views;
        let last = self.mappers.len().saturating_sub(1);
        for (step, mapper) in self.mappers.iter_mut().enumerate() {
            let mut relay = Relay::new(&views[step], &mut *task);
            relay.enter_stage(&views[step], step == last);
            mapper
                .setup(&mut relay)
                .map_err(|source| ChainError::Stage { stage: step, source })?;
        }
        Ok(())
    }

    /// Pasa un registro de entrada por todas las etapas.
    pub fn map(&mut self, key: Record, value: Record, task: &mut dyn StageContext) -> Result<()> {
        let views = &self.views;
        let mappers = &mut self.mappers;
        let Some(first) = views.first() else {
            return Ok(());
        };

        let mut relay = Relay::new(first, task);
        relay.emit(key, value);
        pump(mappers, views, 0, &mut relay)
    }

    /// Cierra cada etapa en orden; lo que emita un `cleanup` sigue por las
    /// etapas posteriores.
    pub fn cleanup(&mut self, task: &mut dyn StageContext) -> Result<()> {
        let views = &self.views;
        let mappers = &mut self.mappers;
        let last = mappers.len().saturating_sub(1);
        for step in 0..mappers.len() {
            let mut relay = Relay::new(&views[step], &mut *task);
            relay.enter_stage(&views[step], step == last);
            mappers[step]
                .cleanup(&mut relay)
                .map_err(|source| ChainError::Stage { stage: step, source })?;
            check_single_emission(&relay, step)?;
            pump(mappers, views, step + 1, &mut relay)?;
        }
        Ok(())
    }
}

fn check_single_emission(relay: &Relay<'_, '_>, step: usize) -> Result<()> {
    let emitted = relay.emitted_since_consume();
    if emitted > 1 {
        return Err(ChainError::FusionViolation {
            stage: step,
            emitted,
        });
    }
    Ok(())
}

/// Corre las etapas `start..` sobre lo que haya en el buffer.
fn pump<'a>(
    mappers: &mut [Box<dyn Mapper>],
    views: &'a [Configuration],
    start: usize,
    relay: &mut Relay<'a, '_>,
) -> Result<()> {
    for step in start..mappers.len() {
        let Some((key, value)) = relay.consume() else {
            // la etapa anterior filtró el registro
            debug!("registro descartado antes de la etapa {}", step);
            return Ok(());
        };

        relay.enter_stage(&views[step], step + 1 == mappers.len());
        mappers[step]
            .map(key, value, &mut *relay)
            .map_err(|source| ChainError::Stage { stage: step, source })?;
        check_single_emission(relay, step)?;
    }

    if let Some((key, value)) = relay.consume() {
        relay
            .forward(key, value)
            .map_err(|source| ChainError::Stage {
                stage: mappers.len().saturating_sub(1),
                source,
            })?;
    }
    Ok(())
}
